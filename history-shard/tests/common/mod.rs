#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use history_shard::{
    Engine, EngineFactory, ShardContext, ShardContextOptions, ShardError,
    ShardSettings, StaticClusterMetadata,
};
use shard_store::memory::MemoryShardStore;
use shard_store::{
    HistoryTask, ShardId, ShardStore, TaskType, UpdateShardRequest,
    WorkflowKey, WorkflowSnapshot, WorkflowState,
};

pub const CLUSTER_A: &str = "clusterA";
pub const CLUSTER_B: &str = "clusterB";

pub struct TestEnvironment {
    pub store: Arc<MemoryShardStore>,
    pub metadata: Arc<StaticClusterMetadata>,
    pub settings: ShardSettings,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self::with_range_size(1000)
    }

    pub fn with_range_size(range_size: i64) -> Self {
        Self::with_store(MemoryShardStore::new(), range_size)
    }

    /// Backed by a store that never publishes range changes.
    pub fn without_range_feed() -> Self {
        Self::with_store(MemoryShardStore::without_range_feed(), 1000)
    }

    fn with_store(store: MemoryShardStore, range_size: i64) -> Self {
        Self {
            store: Arc::new(store),
            metadata: Arc::new(
                StaticClusterMetadata::new(CLUSTER_A, 1)
                    .with_cluster(CLUSTER_B, 2),
            ),
            settings: ShardSettings::default()
                .with_range_size(range_size)
                .with_persistence_timeout(Duration::from_secs(5))
                .with_update_policy(Duration::from_secs(300), 0),
        }
    }

    pub fn with_settings(mut self, settings: ShardSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Stores a record for `shard_id` at `range_id`, as if an earlier owner
    /// had held it.
    pub async fn seed_range(&self, shard_id: ShardId, range_id: i64) {
        let mut info = self
            .store
            .get_or_create_shard(shard_id, "previous-host")
            .await
            .expect("create shard record");
        let previous = info.range_id;
        info.range_id = range_id;
        self.store
            .update_shard(UpdateShardRequest {
                shard_info: info,
                previous_range_id: previous,
            })
            .await
            .expect("seed shard record");
    }

    pub async fn stored_range(&self, shard_id: ShardId) -> i64 {
        self.store
            .get_shard(shard_id)
            .await
            .expect("read shard record")
            .range_id
    }

    pub fn options(
        &self,
        shard_id: ShardId,
        owner: &str,
    ) -> ShardContextOptions {
        ShardContextOptions::new(
            shard_id,
            owner,
            self.store.clone(),
            self.metadata.clone(),
        )
        .with_settings(self.settings.clone())
    }

    pub fn context(&self, shard_id: ShardId, owner: &str) -> Arc<ShardContext> {
        ShardContext::new(self.options(shard_id, owner))
    }

    pub async fn acquire(
        &self,
        shard_id: ShardId,
        owner: &str,
    ) -> Arc<ShardContext> {
        let shard = self.context(shard_id, owner);
        shard.acquire().await.expect("acquire shard");
        shard
    }
}

pub fn workflow(id: &str) -> WorkflowKey {
    WorkflowKey::new("ns-1", id, format!("{}-run", id))
}

pub fn running_snapshot(
    key: &WorkflowKey,
    db_record_version: i64,
) -> WorkflowSnapshot {
    WorkflowSnapshot {
        key: key.clone(),
        state: WorkflowState::Running,
        next_event_id: 2,
        last_write_version: 1,
        db_record_version,
        ..Default::default()
    }
}

pub fn transfer_task(key: &WorkflowKey) -> HistoryTask {
    HistoryTask::new(TaskType::WorkflowTask, key.clone())
}

pub fn is_ownership_lost<T>(
    result: &Result<T, ShardError>,
) -> bool {
    matches!(result, Err(ShardError::OwnershipLost { .. }))
}

#[derive(Default)]
pub struct CountingEngine {
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
}

impl Engine for CountingEngine {
    fn start(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out one shared engine and counts how often it was asked to.
#[derive(Default)]
pub struct CountingEngineFactory {
    pub engine: Arc<CountingEngine>,
    pub created: AtomicUsize,
}

#[async_trait]
impl EngineFactory for CountingEngineFactory {
    async fn create_engine(
        &self,
        _shard: Arc<ShardContext>,
    ) -> Result<Arc<dyn Engine>, ShardError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.engine.clone())
    }
}
