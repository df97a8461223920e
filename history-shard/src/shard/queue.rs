use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use scc::hash_map::Entry::{Occupied, Vacant};
use shard_store::{
    CategoryKind, QueueReaderState, QueueState, ShardInfo, TaskCategory,
    TaskKey,
};

use crate::error::ShardError;

/// Keys of tasks that hold an ID but are not yet durable, plus the highest
/// watermark handed out so far.
#[derive(Debug)]
struct CategoryProgress {
    pending: BTreeMap<TaskKey, usize>,
    last_watermark: TaskKey,
}

impl Default for CategoryProgress {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
            last_watermark: TaskKey::minimum(),
        }
    }
}

impl CategoryProgress {
    fn add(&mut self, key: TaskKey) {
        *self.pending.entry(key).or_insert(0) += 1;
    }

    fn remove(&mut self, key: &TaskKey) {
        if let Some(count) = self.pending.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.pending.remove(key);
            }
        }
    }
}

#[derive(Debug)]
struct UpdatePolicy {
    tasks_completed: usize,
    last_persisted: Instant,
}

/// In-memory queue progress for every task category of one shard.
pub(crate) struct QueueStateTracker {
    states: scc::HashMap<i32, QueueState>,
    progress: scc::HashMap<i32, CategoryProgress>,
    policy: Mutex<UpdatePolicy>,
    min_interval: Duration,
    min_tasks_completed: usize,
}

impl QueueStateTracker {
    pub fn new(min_interval: Duration, min_tasks_completed: usize) -> Self {
        Self {
            states: scc::HashMap::default(),
            progress: scc::HashMap::default(),
            policy: Mutex::new(UpdatePolicy {
                tasks_completed: 0,
                last_persisted: Instant::now(),
            }),
            min_interval,
            min_tasks_completed,
        }
    }

    pub fn load(&self, info: &ShardInfo) {
        for (category_id, state) in info.queue_states.iter() {
            self.states.upsert_sync(*category_id, state.clone());
        }
    }

    pub fn fill(&self, info: &mut ShardInfo) {
        info.queue_states.clear();
        self.states.iter_sync(|category_id, state| {
            info.queue_states.insert(*category_id, state.clone());
            true
        });
    }

    pub fn get(&self, category: TaskCategory) -> Option<QueueState> {
        self.states.read_sync(&category.id(), |_, s| s.clone())
    }

    /// Replaces the category's state unless it would move any reader, or
    /// the reader watermark, backwards.
    pub fn set(
        &self,
        category: TaskCategory,
        state: QueueState,
    ) -> Result<(), ShardError> {
        match self.states.entry_sync(category.id()) {
            Occupied(mut occupied) => {
                if let Some(reason) = state.regression_from(occupied.get()) {
                    return Err(ShardError::InvalidArgument(format!(
                        "{} queue state regresses: {}",
                        category, reason
                    )));
                }
                *occupied.get_mut() = state;
            }
            Vacant(vacant) => {
                vacant.insert_entry(state);
            }
        }
        Ok(())
    }

    /// Replaces one reader's state within `category`.
    pub fn set_reader(
        &self,
        category: TaskCategory,
        reader_id: i64,
        reader: QueueReaderState,
    ) -> Result<(), ShardError> {
        let mut entry = self.states.entry_sync(category.id()).or_default();
        let state = entry.get_mut();
        if let Some(previous) = state.reader_states.get(&reader_id) {
            if reader.regresses(previous) {
                return Err(ShardError::InvalidArgument(format!(
                    "{} reader {} ack level {} is below {}",
                    category, reader_id, reader.ack_level, previous.ack_level
                )));
            }
        }
        state.reader_states.insert(reader_id, reader);
        Ok(())
    }

    /// Counts completed tasks and tells whether the shard record is due for
    /// a write.
    pub fn record_completed(&self, tasks_completed: usize) -> bool {
        let mut policy = self.policy.lock().unwrap_or_else(|e| e.into_inner());
        policy.tasks_completed += tasks_completed;
        policy.tasks_completed >= self.min_tasks_completed
            || policy.last_persisted.elapsed() >= self.min_interval
    }

    pub fn mark_persisted(&self) {
        let mut policy = self.policy.lock().unwrap_or_else(|e| e.into_inner());
        policy.tasks_completed = 0;
        policy.last_persisted = Instant::now();
    }

    /// Registers a key that will be written shortly. Scheduled keys firing
    /// before a watermark that was already handed out are moved up to it,
    /// so readers never skip them. Returns the key actually registered.
    pub fn add_pending(&self, category: TaskCategory, key: TaskKey) -> TaskKey {
        let mut entry = self.progress.entry_sync(category.id()).or_default();
        let progress = entry.get_mut();
        let mut key = key;
        if category.kind() == CategoryKind::Scheduled
            && key.fire_time < progress.last_watermark.fire_time
        {
            key.fire_time = progress.last_watermark.fire_time;
        }
        progress.add(key);
        key
    }

    pub fn remove_pending(&self, category: TaskCategory, key: &TaskKey) {
        self.progress.update_sync(&category.id(), |_, progress| {
            progress.remove(key);
        });
    }

    /// Upper bound, exclusive, below which every task of `category` is
    /// durable. Immediate categories stop at the lowest pending ID or at the
    /// next unissued ID; scheduled ones at the lowest pending key or now.
    /// Never moves backwards.
    pub fn exclusive_high_watermark(
        &self,
        category: TaskCategory,
        next_task_id: i64,
        now: DateTime<Utc>,
    ) -> TaskKey {
        let mut entry = self.progress.entry_sync(category.id()).or_default();
        let progress = entry.get_mut();
        let lowest_pending = progress.pending.keys().next().copied();
        let candidate = match category.kind() {
            CategoryKind::Immediate => lowest_pending
                .unwrap_or_else(|| TaskKey::immediate(next_task_id)),
            CategoryKind::Scheduled => {
                let now_key = TaskKey::new(now, 0);
                match lowest_pending {
                    Some(pending) if pending < now_key => pending,
                    _ => now_key,
                }
            }
        };
        if candidate > progress.last_watermark {
            progress.last_watermark = candidate;
        }
        progress.last_watermark
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use shard_store::{QueueReaderState, DEFAULT_READER_ID};

    use super::*;

    fn tracker() -> QueueStateTracker {
        QueueStateTracker::new(Duration::from_secs(300), 0)
    }

    fn state(ack: i64) -> QueueState {
        QueueState::new(TaskKey::immediate(ack + 10)).with_reader(
            DEFAULT_READER_ID,
            QueueReaderState::new(TaskKey::immediate(ack)),
        )
    }

    #[test]
    fn regression_is_rejected_and_state_kept() {
        let t = tracker();
        t.set(TaskCategory::TRANSFER, state(100)).unwrap();
        let err = t.set(TaskCategory::TRANSFER, state(90)).unwrap_err();
        assert!(matches!(err, ShardError::InvalidArgument(_)));
        assert_eq!(t.get(TaskCategory::TRANSFER), Some(state(100)));
        t.set(TaskCategory::TRANSFER, state(120)).unwrap();
        assert_eq!(t.get(TaskCategory::TRANSFER), Some(state(120)));
    }

    #[test]
    fn load_and_fill_carry_every_category() {
        let t = tracker();
        t.set(TaskCategory::TIMER, state(5)).unwrap();
        t.set_reader(
            TaskCategory::REPLICATION,
            (2 << 32) | 1,
            QueueReaderState::new(TaskKey::immediate(42)),
        )
        .unwrap();

        let mut info = ShardInfo::new(1, "me");
        t.fill(&mut info);
        assert_eq!(info.queue_states.len(), 2);

        let other = tracker();
        other.load(&info);
        assert_eq!(other.get(TaskCategory::TIMER), Some(state(5)));
        assert!(other.get(TaskCategory::TRANSFER).is_none());
    }

    #[test]
    fn update_policy_counts_tasks() {
        let t = QueueStateTracker::new(Duration::from_secs(3600), 10);
        assert!(!t.record_completed(4));
        assert!(!t.record_completed(5));
        assert!(t.record_completed(1));
        t.mark_persisted();
        assert!(!t.record_completed(9));

        let always = tracker();
        assert!(always.record_completed(0));
    }

    #[test]
    fn immediate_watermark_stops_at_pending() {
        let t = tracker();
        let now = Utc::now();
        let cat = TaskCategory::TRANSFER;
        assert_eq!(
            t.exclusive_high_watermark(cat, 1000, now),
            TaskKey::immediate(1000)
        );

        t.add_pending(cat, TaskKey::immediate(1000));
        t.add_pending(cat, TaskKey::immediate(1001));
        assert_eq!(
            t.exclusive_high_watermark(cat, 1002, now),
            TaskKey::immediate(1000)
        );

        t.remove_pending(cat, &TaskKey::immediate(1000));
        assert_eq!(
            t.exclusive_high_watermark(cat, 1002, now),
            TaskKey::immediate(1001)
        );
        t.remove_pending(cat, &TaskKey::immediate(1001));
        assert_eq!(
            t.exclusive_high_watermark(cat, 1002, now),
            TaskKey::immediate(1002)
        );
    }

    #[test]
    fn scheduled_watermark_is_monotone_and_bumps_late_keys() {
        let t = tracker();
        let cat = TaskCategory::TIMER;
        let now = Utc::now();
        let first = t.exclusive_high_watermark(cat, 0, now);
        assert_eq!(first, TaskKey::new(now, 0));

        let earlier = now - ChronoDuration::seconds(30);
        assert_eq!(t.exclusive_high_watermark(cat, 0, earlier), first);

        let registered = t.add_pending(cat, TaskKey::new(earlier, 77));
        assert_eq!(registered, TaskKey::new(now, 77));
        assert!(registered > first);

        let later = now + ChronoDuration::seconds(5);
        assert_eq!(t.exclusive_high_watermark(cat, 0, later), registered);
    }
}
