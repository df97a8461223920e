use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::task::{TaskKey, TaskRange};

/// Reader used by task processors that do not shard a queue further.
pub const DEFAULT_READER_ID: i64 = 0;

/// Progress of one reader over a category queue.
///
/// Every key below `ack_level` is completed. `completed_ranges` holds the
/// sorted, disjoint ranges above it that finished out of order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueReaderState {
    pub ack_level: TaskKey,
    pub completed_ranges: Vec<TaskRange>,
}

impl Default for QueueReaderState {
    fn default() -> Self {
        Self::new(TaskKey::minimum())
    }
}

impl QueueReaderState {
    pub fn new(ack_level: TaskKey) -> Self {
        Self {
            ack_level,
            completed_ranges: Vec::new(),
        }
    }

    /// Records `range` as completed and returns the resulting ack level.
    ///
    /// Ranges touching each other are merged, and a range that reaches the
    /// ack level is folded into it.
    pub fn complete_range(&mut self, range: TaskRange) -> TaskKey {
        if range.is_empty() || range.exclusive_max <= self.ack_level {
            return self.ack_level;
        }
        let mut range = range;
        if range.inclusive_min < self.ack_level {
            range.inclusive_min = self.ack_level;
        }

        let pos = self
            .completed_ranges
            .partition_point(|r| r.inclusive_min < range.inclusive_min);
        self.completed_ranges.insert(pos, range);

        let mut merged: Vec<TaskRange> =
            Vec::with_capacity(self.completed_ranges.len());
        for r in self.completed_ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if r.inclusive_min <= last.exclusive_max => {
                    if r.exclusive_max > last.exclusive_max {
                        last.exclusive_max = r.exclusive_max;
                    }
                }
                _ => merged.push(r),
            }
        }

        let mut folded = 0;
        for r in merged.iter() {
            if r.inclusive_min > self.ack_level {
                break;
            }
            if r.exclusive_max > self.ack_level {
                self.ack_level = r.exclusive_max;
            }
            folded += 1;
        }
        merged.drain(..folded);
        self.completed_ranges = merged;
        self.ack_level
    }

    /// True when `self` would move the ack level below `previous`.
    #[inline]
    pub fn regresses(&self, previous: &QueueReaderState) -> bool {
        self.ack_level < previous.ack_level
    }
}

/// Persisted state of one category queue.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueState {
    pub reader_states: HashMap<i64, QueueReaderState>,
    pub exclusive_reader_high_watermark: TaskKey,
}

impl QueueState {
    pub fn new(exclusive_reader_high_watermark: TaskKey) -> Self {
        Self {
            reader_states: HashMap::new(),
            exclusive_reader_high_watermark,
        }
    }

    pub fn with_reader(
        mut self,
        reader_id: i64,
        state: QueueReaderState,
    ) -> Self {
        self.reader_states.insert(reader_id, state);
        self
    }

    /// Lowest ack level over all readers, if any reader exists.
    pub fn min_ack_level(&self) -> Option<TaskKey> {
        self.reader_states.values().map(|r| r.ack_level).min()
    }

    /// Describes the first way `self` regresses `previous`, if any.
    pub fn regression_from(&self, previous: &QueueState) -> Option<String> {
        if self.exclusive_reader_high_watermark
            < previous.exclusive_reader_high_watermark
        {
            return Some(format!(
                "reader high watermark {} is below {}",
                self.exclusive_reader_high_watermark,
                previous.exclusive_reader_high_watermark
            ));
        }
        for (reader_id, state) in self.reader_states.iter() {
            if let Some(prev) = previous.reader_states.get(reader_id) {
                if state.regresses(prev) {
                    return Some(format!(
                        "reader {} ack level {} is below {}",
                        reader_id, state.ack_level, prev.ack_level
                    ));
                }
            }
        }
        None
    }
}
