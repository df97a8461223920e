use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shard_store::{QueueReaderState, QueueState, TaskCategory, TaskKey};

use crate::error::ShardError;
use crate::metadata::Namespace;

use super::context::ShardContext;
use super::replication::ReplicationStatus;
use super::vclock::VectorClock;

/// Monotonic task IDs backed by the shard's range lease.
#[async_trait]
pub trait TaskIdSource: Send + Sync {
    async fn generate_task_id(&self) -> Result<i64, ShardError>;

    /// `number` strictly increasing IDs. Zero yields an empty list; more
    /// than one range holds is rejected.
    async fn generate_task_ids(&self, number: usize)
        -> Result<Vec<i64>, ShardError>;
}

#[async_trait]
pub trait VectorClockSource: Send + Sync {
    async fn new_vector_clock(&self) -> Result<VectorClock, ShardError>;

    /// Stamp of the most recently issued task ID, without issuing a new one.
    fn current_vector_clock(&self) -> Result<VectorClock, ShardError>;
}

/// Per-category queue progress.
#[async_trait]
pub trait QueueStateStore: Send + Sync {
    fn get_queue_exclusive_high_read_watermark(
        &self,
        category: TaskCategory,
    ) -> Result<TaskKey, ShardError>;

    fn get_queue_state(
        &self,
        category: TaskCategory,
    ) -> Result<Option<QueueState>, ShardError>;

    async fn set_queue_state(
        &self,
        category: TaskCategory,
        tasks_completed: usize,
        state: QueueState,
    ) -> Result<(), ShardError>;

    async fn update_replication_queue_reader_state(
        &self,
        reader_id: i64,
        state: QueueReaderState,
    ) -> Result<(), ShardError>;
}

/// Replication progress towards remote clusters.
#[async_trait]
pub trait ReplicationProgress: Send + Sync {
    fn get_replicator_dlq_ack_level(
        &self,
        source_cluster: &str,
    ) -> Result<i64, ShardError>;

    async fn update_replicator_dlq_ack_level(
        &self,
        source_cluster: &str,
        ack_level: i64,
    ) -> Result<(), ShardError>;

    fn update_remote_cluster_info(
        &self,
        cluster: &str,
        ack_task_id: i64,
        ack_time: DateTime<Utc>,
    ) -> Result<(), ShardError>;

    fn update_remote_reader_info(
        &self,
        reader_id: i64,
        ack_task_id: i64,
        ack_time: DateTime<Utc>,
    ) -> Result<(), ShardError>;

    fn set_current_time(
        &self,
        cluster: &str,
        time: DateTime<Utc>,
    ) -> Result<(), ShardError>;

    fn get_current_time(
        &self,
        cluster: &str,
    ) -> Result<DateTime<Utc>, ShardError>;

    /// Ack status of `clusters`, or of every remote cluster when empty,
    /// together with the namespaces in handover.
    fn get_replication_status(
        &self,
        clusters: &[String],
    ) -> Result<ReplicationStatus, ShardError>;

    fn update_handover_namespace(
        &self,
        namespace: &Namespace,
        deleted_from_storage: bool,
    ) -> Result<(), ShardError>;
}

/// The workflow engine bound to one shard. Created lazily on first use and
/// stopped when the shard leaves the active state.
pub trait Engine: Send + Sync {
    fn start(&self);

    fn stop(&self);
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create_engine(
        &self,
        shard: Arc<ShardContext>,
    ) -> Result<Arc<dyn Engine>, ShardError>;
}
