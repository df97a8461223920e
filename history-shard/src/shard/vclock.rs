use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shard_store::ShardId;

use crate::error::ShardError;

/// A causal stamp for events produced by a shard.
///
/// `clock` is drawn from the shard's task-ID sequence, so stamps issued by
/// a later owner always compare greater than those of an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorClock {
    pub cluster_id: i64,
    pub shard_id: ShardId,
    pub clock: i64,
    pub timestamp: DateTime<Utc>,
}

impl VectorClock {
    pub fn new(cluster_id: i64, shard_id: ShardId, clock: i64) -> Self {
        Self {
            cluster_id,
            shard_id,
            clock,
            timestamp: Utc::now(),
        }
    }

    /// Orders two stamps of the same shard by clock, breaking ties on the
    /// cluster ID. Stamps of different shards are not comparable.
    pub fn compare(&self, other: &VectorClock) -> Result<Ordering, ShardError> {
        if self.shard_id != other.shard_id {
            return Err(ShardError::InvalidArgument(format!(
                "cannot compare clocks of shard {} and shard {}",
                self.shard_id, other.shard_id
            )));
        }
        Ok(self
            .clock
            .cmp(&other.clock)
            .then(self.cluster_id.cmp(&other.cluster_id)))
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}@{}",
            self.cluster_id, self.shard_id, self.clock
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_by_clock_then_cluster() {
        let a = VectorClock::new(1, 3, 100);
        let b = VectorClock::new(1, 3, 101);
        let c = VectorClock::new(2, 3, 100);
        assert_eq!(a.compare(&b).unwrap(), Ordering::Less);
        assert_eq!(b.compare(&a).unwrap(), Ordering::Greater);
        assert_eq!(a.compare(&c).unwrap(), Ordering::Less);
        assert_eq!(a.compare(&a).unwrap(), Ordering::Equal);
    }

    #[test]
    fn other_shard_is_rejected() {
        let a = VectorClock::new(1, 3, 100);
        let b = VectorClock::new(1, 4, 100);
        assert!(matches!(a.compare(&b), Err(ShardError::InvalidArgument(_))));
    }
}
