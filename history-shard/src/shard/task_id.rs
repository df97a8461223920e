use std::ops::Range;
use std::sync::Mutex;

use crate::error::ShardError;

#[derive(Debug, Clone, Copy)]
struct IdBlock {
    range_id: i64,
    next: i64,
    end: i64,
}

/// First ID and exclusive end of the block leased by `range_id`.
pub(crate) fn block_bounds(
    range_id: i64,
    range_size: i64,
) -> Result<(i64, i64), ShardError> {
    let overflow = || {
        ShardError::InvalidArgument(format!(
            "range {} with size {} overflows the task ID space",
            range_id, range_size
        ))
    };
    let start = range_id.checked_mul(range_size).ok_or_else(overflow)?;
    let end = start.checked_add(range_size).ok_or_else(overflow)?;
    Ok((start, end))
}

/// Hands out task IDs from the block of the current range lease.
///
/// The cursor and the range ID share one mutex; nothing else is done while
/// holding it.
#[derive(Debug)]
pub(crate) struct TaskIdGenerator {
    range_size: i64,
    block: Mutex<IdBlock>,
}

impl TaskIdGenerator {
    pub fn new(range_size: i64) -> Self {
        Self {
            range_size,
            block: Mutex::new(IdBlock {
                range_id: 0,
                next: 0,
                end: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IdBlock> {
        self.block.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[inline]
    pub fn range_size(&self) -> i64 {
        self.range_size
    }

    /// Installs the block of a freshly persisted range.
    pub fn reset(&self, range_id: i64) -> Result<(), ShardError> {
        let (start, end) = block_bounds(range_id, self.range_size)?;
        let mut block = self.lock();
        *block = IdBlock {
            range_id,
            next: start,
            end,
        };
        Ok(())
    }

    /// Takes `n` consecutive IDs from the current block. When fewer remain,
    /// returns the range ID whose block is exhausted so the caller can renew
    /// exactly that lease.
    pub fn try_allocate(&self, n: i64) -> Result<Range<i64>, i64> {
        let mut block = self.lock();
        if block.end - block.next < n {
            return Err(block.range_id);
        }
        let start = block.next;
        block.next += n;
        Ok(start..block.next)
    }

    #[inline]
    pub fn range_id(&self) -> i64 {
        self.lock().range_id
    }

    /// The ID the next allocation would start from.
    #[inline]
    pub fn peek_next(&self) -> i64 {
        self.lock().next
    }
}
