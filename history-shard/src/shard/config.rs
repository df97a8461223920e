use std::time::Duration;

use dynamic_config::{precedence_shard_id, Collection};
use shard_store::ShardId;

use crate::ShardConfig;

pub const KEY_UPDATE_MIN_INTERVAL: &str = "history.shardUpdateMinInterval";
pub const KEY_UPDATE_MIN_TASKS_COMPLETED: &str =
    "history.shardUpdateMinTasksCompleted";
pub const KEY_PERSISTENCE_TIMEOUT: &str = "history.persistenceTimeout";

/// Per-shard tunables, fixed for the lifetime of one context.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardSettings {
    pub range_size: i64,
    pub persistence_timeout: Duration,
    /// Queue state is persisted at least this often while tasks complete.
    pub update_min_interval: Duration,
    /// Queue state is persisted once this many tasks completed since the
    /// last write. Zero persists on every update.
    pub update_min_tasks_completed: usize,
}

impl Default for ShardSettings {
    fn default() -> Self {
        Self::from_config(&ShardConfig::default())
    }
}

impl ShardSettings {
    pub fn from_config(conf: &ShardConfig) -> Self {
        Self {
            range_size: conf.range_size,
            persistence_timeout: Duration::from_millis(
                conf.persistence_timeout_ms,
            ),
            update_min_interval: Duration::from_millis(
                conf.update_min_interval_ms,
            ),
            update_min_tasks_completed: conf.update_min_tasks_completed,
        }
    }

    /// Applies dynamic overrides constrained to `shard_id` (or global) on
    /// top of the static configuration.
    pub fn resolve(
        conf: &ShardConfig,
        dynamic: Option<&Collection>,
        shard_id: ShardId,
    ) -> Self {
        let base = Self::from_config(conf);
        let Some(dc) = dynamic else {
            return base;
        };
        let precedence = precedence_shard_id(shard_id);
        Self {
            range_size: base.range_size,
            persistence_timeout: dc.get_duration(
                KEY_PERSISTENCE_TIMEOUT,
                base.persistence_timeout,
                &precedence,
            ),
            update_min_interval: dc.get_duration(
                KEY_UPDATE_MIN_INTERVAL,
                base.update_min_interval,
                &precedence,
            ),
            update_min_tasks_completed: dc.get(
                KEY_UPDATE_MIN_TASKS_COMPLETED,
                base.update_min_tasks_completed,
                &precedence,
            ),
        }
    }

    pub fn with_range_size(mut self, range_size: i64) -> Self {
        self.range_size = range_size;
        self
    }

    pub fn with_persistence_timeout(mut self, timeout: Duration) -> Self {
        self.persistence_timeout = timeout;
        self
    }

    pub fn with_update_policy(
        mut self,
        min_interval: Duration,
        min_tasks_completed: usize,
    ) -> Self {
        self.update_min_interval = min_interval;
        self.update_min_tasks_completed = min_tasks_completed;
        self
    }
}
