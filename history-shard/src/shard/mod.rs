mod config;
mod context;
mod controller;
mod execution;
mod queue;
mod range;
mod replication;
mod state;
mod task_id;
mod traits;
mod vclock;

pub use config::{
    ShardSettings, KEY_PERSISTENCE_TIMEOUT, KEY_UPDATE_MIN_INTERVAL,
    KEY_UPDATE_MIN_TASKS_COMPLETED,
};
pub use context::{ShardContext, ShardContextOptions};
pub use controller::{ControllerStats, ShardController};
pub use execution::{DeleteStage, DeleteWorkflowExecutionStage};
pub use replication::{
    reader_cluster_and_shard, replication_reader_id, ClusterReplicationStatus,
    HandoverNamespaceStatus, ReplicationStatus,
};
pub use state::ContextState;
pub use traits::{
    Engine, EngineFactory, QueueStateStore, ReplicationProgress, TaskIdSource,
    VectorClockSource,
};
pub use vclock::VectorClock;
