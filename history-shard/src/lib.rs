pub mod error;
pub mod metadata;
pub mod shard;
pub mod telemetry;

use envconfig::Envconfig;

pub use error::ShardError;
pub use metadata::{
    ClusterMetadata, Namespace, ReplicationState, StaticClusterMetadata,
};
pub use shard::{
    ContextState, DeleteStage, DeleteWorkflowExecutionStage, Engine,
    EngineFactory, QueueStateStore, ReplicationProgress, ReplicationStatus,
    ShardContext, ShardContextOptions, ShardController, ShardSettings,
    TaskIdSource, VectorClock, VectorClockSource,
};

#[derive(Envconfig, Clone, Debug)]
pub struct ShardConfig {
    /// Task IDs granted per range lease.
    #[envconfig(from = "SHARD_RANGE_SIZE", default = "1048576")]
    pub range_size: i64,
    #[envconfig(from = "SHARD_OWNER")]
    pub owner: Option<String>,
    #[envconfig(from = "SHARD_CLUSTER_NAME", default = "active")]
    pub cluster_name: String,
    #[envconfig(from = "SHARD_CLUSTER_ID", default = "1")]
    pub cluster_id: i64,
    #[envconfig(from = "SHARD_NUM_SHARDS", default = "4")]
    pub num_shards: i32,
    #[envconfig(from = "SHARD_PERSISTENCE_TIMEOUT_MS", default = "10000")]
    pub persistence_timeout_ms: u64,
    #[envconfig(from = "SHARD_UPDATE_MIN_INTERVAL_MS", default = "300000")]
    pub update_min_interval_ms: u64,
    #[envconfig(from = "SHARD_UPDATE_MIN_TASKS_COMPLETED", default = "0")]
    pub update_min_tasks_completed: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            range_size: 1 << 20,
            owner: None,
            cluster_name: "active".to_string(),
            cluster_id: 1,
            num_shards: 4,
            persistence_timeout_ms: 10_000,
            update_min_interval_ms: 300_000,
            update_min_tasks_completed: 0,
        }
    }
}

impl ShardConfig {
    /// The configured owner identity, or a random one for this process.
    pub fn get_owner(&self) -> String {
        match &self.owner {
            Some(owner) => owner.clone(),
            None => format!("history-{:016x}", rand::random::<u64>()),
        }
    }
}
