use std::collections::BTreeMap;
use std::future::Future;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shard_store::{
    HistoryTask, QueueReaderState, QueueState, ShardId, ShardInfo,
    ShardPersistence, StoreError, StoreResult, TaskCategory, TaskKey,
};
use tokio::sync::{watch, Mutex as AsyncMutex, OnceCell, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ShardError;
use crate::metadata::{ClusterMetadata, Namespace};

use super::config::ShardSettings;
use super::queue::QueueStateTracker;
use super::range::RangeAllocator;
use super::replication::{
    reader_cluster_and_shard, ReplicationStatus, ReplicationTracker,
};
use super::state::ContextState;
use super::task_id::TaskIdGenerator;
use super::traits::{
    Engine, EngineFactory, QueueStateStore, ReplicationProgress, TaskIdSource,
    VectorClockSource,
};
use super::vclock::VectorClock;

/// Everything needed to build a [`ShardContext`].
pub struct ShardContextOptions {
    pub shard_id: ShardId,
    pub owner: String,
    pub settings: ShardSettings,
    pub store: Arc<dyn ShardPersistence>,
    pub cluster_metadata: Arc<dyn ClusterMetadata>,
    pub engine_factory: Option<Arc<dyn EngineFactory>>,
}

impl ShardContextOptions {
    pub fn new(
        shard_id: ShardId,
        owner: impl Into<String>,
        store: Arc<dyn ShardPersistence>,
        cluster_metadata: Arc<dyn ClusterMetadata>,
    ) -> Self {
        Self {
            shard_id,
            owner: owner.into(),
            settings: ShardSettings::default(),
            store,
            cluster_metadata,
            engine_factory: None,
        }
    }

    pub fn with_settings(mut self, settings: ShardSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_engine_factory(
        mut self,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        self.engine_factory = Some(factory);
        self
    }
}

/// Marks the shard as needing an ownership check if dropped before the
/// guarded write reports back.
struct InDoubtGuard<'a> {
    flag: &'a AtomicBool,
    armed: bool,
}

impl<'a> InDoubtGuard<'a> {
    fn arm(flag: &'a AtomicBool) -> Self {
        Self { flag, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InDoubtGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(true, Ordering::Release);
        }
    }
}

/// The single authority for one shard while this process owns it.
///
/// A context is acquired once, serves while `Active`, and is discarded once
/// it turns `Invalid` or `Stopped`; a new owner always builds a new context.
/// Every persisted write carries the range ID of the current lease, so a
/// context that lost the shard can never overwrite its successor.
pub struct ShardContext {
    pub(super) shard_id: ShardId,
    owner: String,
    settings: ShardSettings,
    cluster_metadata: Arc<dyn ClusterMetadata>,
    pub(super) store: Arc<dyn ShardPersistence>,
    allocator: RangeAllocator,
    pub(super) task_ids: TaskIdGenerator,
    pub(super) queues: QueueStateTracker,
    replication: ReplicationTracker,
    state: watch::Sender<ContextState>,
    range_feed: OnceLock<watch::Receiver<i64>>,
    /// Highest range this context has written or is about to write.
    highest_range: AtomicI64,
    stolen_since_renew: AtomicI32,
    /// Set when a write may or may not have landed; the next mutation
    /// re-reads the shard record first.
    in_doubt: AtomicBool,
    /// Shared by writes fenced with the current range, exclusive for renewal.
    pub(super) range_lock: RwLock<()>,
    /// Serializes shard record snapshots.
    persist_lock: AsyncMutex<()>,
    shutdown: CancellationToken,
    engine_factory: Option<Arc<dyn EngineFactory>>,
    engine: OnceCell<Arc<dyn Engine>>,
    pub(super) speculative: Mutex<BTreeMap<TaskKey, HistoryTask>>,
    this: Weak<ShardContext>,
}

impl ShardContext {
    pub fn new(options: ShardContextOptions) -> Arc<Self> {
        let ShardContextOptions {
            shard_id,
            owner,
            settings,
            store,
            cluster_metadata,
            engine_factory,
        } = options;
        Arc::new_cyclic(|this| Self {
            shard_id,
            allocator: RangeAllocator::new(
                store.clone(),
                shard_id,
                owner.clone(),
            ),
            owner,
            task_ids: TaskIdGenerator::new(settings.range_size),
            queues: QueueStateTracker::new(
                settings.update_min_interval,
                settings.update_min_tasks_completed,
            ),
            replication: ReplicationTracker::new(),
            settings,
            cluster_metadata,
            store,
            state: watch::channel(ContextState::Initializing).0,
            range_feed: OnceLock::new(),
            highest_range: AtomicI64::new(0),
            stolen_since_renew: AtomicI32::new(0),
            in_doubt: AtomicBool::new(false),
            range_lock: RwLock::new(()),
            persist_lock: AsyncMutex::new(()),
            shutdown: CancellationToken::new(),
            engine_factory,
            engine: OnceCell::new(),
            speculative: Mutex::new(BTreeMap::new()),
            this: this.clone(),
        })
    }

    #[inline]
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    #[inline]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[inline]
    pub fn settings(&self) -> &ShardSettings {
        &self.settings
    }

    #[inline]
    pub fn cluster_metadata(&self) -> &Arc<dyn ClusterMetadata> {
        &self.cluster_metadata
    }

    /// Range ID of the lease currently in use.
    #[inline]
    pub fn range_id(&self) -> i64 {
        self.task_ids.range_id()
    }

    #[inline]
    pub fn state(&self) -> ContextState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ContextState> {
        self.state.subscribe()
    }

    /// True until the context turns `Invalid` or `Stopped`.
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.state().is_terminal()
    }

    /// Takes the range lease and loads persisted progress. Must be called
    /// exactly once, before anything else.
    pub async fn acquire(&self) -> Result<(), ShardError> {
        match self.state() {
            ContextState::Initializing => {}
            ContextState::Active => {
                return Err(ShardError::InvalidArgument(format!(
                    "shard {} is already acquired",
                    self.shard_id
                )))
            }
            _ => return Err(self.ownership_lost()),
        }
        if self.settings.range_size <= 0 {
            self.invalidate("range size must be positive");
            return Err(ShardError::InvalidArgument(format!(
                "range size {} must be positive",
                self.settings.range_size
            )));
        }

        let _range = self.range_lock.write().await;
        let acquired = self.fenced("acquire_shard", self.allocator.acquire());
        let info = match acquired.await {
            Ok(info) => info,
            Err(err) => {
                self.invalidate(&format!("acquisition failed: {}", err));
                return Err(err);
            }
        };
        if let Err(err) = self.task_ids.reset(info.range_id) {
            self.invalidate(&err.to_string());
            return Err(err);
        }
        self.highest_range.store(info.range_id, Ordering::Release);
        self.stolen_since_renew
            .store(info.stolen_since_renew, Ordering::Relaxed);
        self.queues.load(&info);
        self.replication.load(&info);
        if let Some(feed) = self.store.subscribe_range(self.shard_id) {
            let _ = self.range_feed.set(feed);
        }

        if !self.transition(ContextState::Active) {
            return Err(self.ownership_lost());
        }
        info!(
            "shard {}: acquired range {} as {}",
            self.shard_id, info.range_id, self.owner
        );
        Ok(())
    }

    /// Proves ownership with a fenced write of the current shard record.
    pub async fn assert_ownership(&self) -> Result<(), ShardError> {
        self.check_active()?;
        self.persist_shard_info().await
    }

    /// Stops serving because the host learned that ownership moved.
    pub fn unload_for_ownership_lost(&self) {
        if self.transition(ContextState::Stopped) {
            info!("shard {}: unloaded after ownership loss", self.shard_id);
        }
    }

    /// Final teardown by the host. Idempotent.
    pub fn finish_stop(&self) {
        if self.transition(ContextState::Stopped) {
            info!("shard {}: stopped", self.shard_id);
        }
    }

    /// The engine bound to this shard, created and started on first use.
    pub async fn get_engine(&self) -> Result<Arc<dyn Engine>, ShardError> {
        self.check_active()?;
        let factory = self.engine_factory.as_ref().ok_or_else(|| {
            ShardError::InvalidArgument(format!(
                "shard {} has no engine factory",
                self.shard_id
            ))
        })?;
        let engine = self
            .engine
            .get_or_try_init(|| async {
                let shard = self
                    .this
                    .upgrade()
                    .ok_or_else(|| self.ownership_lost())?;
                let engine = factory.create_engine(shard).await?;
                engine.start();
                info!("shard {}: engine started", self.shard_id);
                Ok::<_, ShardError>(engine)
            })
            .await?
            .clone();
        if self.state().is_terminal() {
            engine.stop();
            return Err(self.ownership_lost());
        }
        Ok(engine)
    }

    pub(super) fn ownership_lost(&self) -> ShardError {
        ShardError::OwnershipLost {
            shard_id: self.shard_id,
        }
    }

    fn transition(&self, next: ContextState) -> bool {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if !state.can_transition_to(next) {
                return false;
            }
            previous = Some(*state);
            *state = next;
            true
        });
        let Some(previous) = previous else {
            return false;
        };
        debug!("shard {}: {} -> {}", self.shard_id, previous, next);
        if next.is_terminal() && !previous.is_terminal() {
            self.shutdown.cancel();
            if let Some(engine) = self.engine.get() {
                engine.stop();
            }
        }
        true
    }

    pub(super) fn invalidate(&self, reason: &str) {
        if self.transition(ContextState::Invalid) {
            warn!("shard {}: invalidated: {}", self.shard_id, reason);
        }
    }

    /// Fails fast unless the context is active and no newer range has been
    /// observed in storage.
    pub(super) fn check_active(&self) -> Result<(), ShardError> {
        let state = self.state();
        match state {
            ContextState::Active => {}
            ContextState::Initializing => {
                return Err(ShardError::Transient(format!(
                    "shard {} is still being acquired",
                    self.shard_id
                )))
            }
            ContextState::Invalid | ContextState::Stopped => {
                return Err(self.ownership_lost())
            }
        }
        if let Some(feed) = self.range_feed.get() {
            let stored = *feed.borrow();
            if stored > self.highest_range.load(Ordering::Acquire) {
                self.invalidate(&format!(
                    "range {} taken by another owner",
                    stored
                ));
                return Err(self.ownership_lost());
            }
        }
        Ok(())
    }

    /// Runs a persistence write under the persistence timeout. Writes cut
    /// short by a timeout, a transport error or shutdown leave the shard in
    /// doubt.
    pub(super) async fn fenced<T, F>(
        &self,
        op: &'static str,
        fut: F,
    ) -> Result<T, ShardError>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let mut guard = InDoubtGuard::arm(&self.in_doubt);
        let timeout = self.settings.persistence_timeout;
        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(self.ownership_lost()),
            res = tokio::time::timeout(timeout, fut) => res,
        };
        guard.disarm();
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(format!(
                "{} exceeded {:?}",
                op, timeout
            ))),
        };
        result.map_err(|err| self.on_store_error(op, err))
    }

    /// A read under the persistence timeout.
    pub(super) async fn read<T, F>(
        &self,
        op: &'static str,
        fut: F,
    ) -> Result<T, ShardError>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let timeout = self.settings.persistence_timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result.map_err(ShardError::from),
            Err(_) => Err(ShardError::Transient(format!(
                "{} exceeded {:?}",
                op, timeout
            ))),
        }
    }

    fn on_store_error(&self, op: &str, err: StoreError) -> ShardError {
        if err.is_ambiguous() {
            self.in_doubt.store(true, Ordering::Release);
            warn!(
                "shard {}: outcome of {} unknown: {}",
                self.shard_id, op, err
            );
        }
        if let StoreError::ShardOwnershipLost {
            current_range_id, ..
        } = &err
        {
            self.invalidate(&format!(
                "{} rejected, stored range is {}",
                op, current_range_id
            ));
        }
        err.into()
    }

    /// After an ambiguous write, confirms the stored range is still ours
    /// before anything else is written.
    pub(super) async fn ensure_verified(&self) -> Result<(), ShardError> {
        if !self.in_doubt.load(Ordering::Acquire) {
            return Ok(());
        }
        let _range = self.range_lock.read().await;
        self.check_active()?;
        let stored = self
            .read("verify_ownership", self.allocator.read())
            .await?;
        let ours = self.task_ids.range_id();
        if stored.range_id != ours {
            self.invalidate(&format!(
                "stored range {} is not {}",
                stored.range_id, ours
            ));
            return Err(self.ownership_lost());
        }
        self.in_doubt.store(false, Ordering::Release);
        debug!("shard {}: ownership verified at range {}", self.shard_id, ours);
        Ok(())
    }

    fn snapshot(&self, range_id: i64) -> ShardInfo {
        let mut info = ShardInfo::new(self.shard_id, self.owner.clone());
        info.range_id = range_id;
        info.stolen_since_renew =
            self.stolen_since_renew.load(Ordering::Relaxed);
        self.queues.fill(&mut info);
        self.replication.fill(&mut info);
        info
    }

    /// Writes in-memory progress to the shard record, fenced by the current
    /// range.
    pub(super) async fn persist_shard_info(&self) -> Result<(), ShardError> {
        self.ensure_verified().await?;
        let _range = self.range_lock.read().await;
        let _persist = self.persist_lock.lock().await;
        self.check_active()?;
        let snapshot = self.snapshot(self.task_ids.range_id());
        self.fenced("update_shard", self.allocator.persist(snapshot))
            .await?;
        self.queues.mark_persisted();
        Ok(())
    }

    /// Moves to the next range once the block of `exhausted` is used up.
    /// Any failure invalidates the context.
    async fn renew_range(&self, exhausted: i64) -> Result<(), ShardError> {
        let _range = self.range_lock.write().await;
        if self.task_ids.range_id() != exhausted {
            return Ok(());
        }
        self.check_active()?;
        let snapshot = self.snapshot(exhausted);
        self.highest_range.fetch_max(exhausted + 1, Ordering::AcqRel);
        let result = self
            .fenced("renew_range", self.allocator.renew(snapshot))
            .await
            .and_then(|info| self.task_ids.reset(info.range_id));
        match result {
            Ok(()) => {
                self.stolen_since_renew.store(0, Ordering::Relaxed);
                self.queues.mark_persisted();
                self.in_doubt.store(false, Ordering::Release);
                info!(
                    "shard {}: renewed range {} -> {}",
                    self.shard_id,
                    exhausted,
                    exhausted + 1
                );
                Ok(())
            }
            Err(err) => {
                self.invalidate(&format!("range renewal failed: {}", err));
                Err(err)
            }
        }
    }

    /// `number` consecutive IDs, renewing the lease when the current block
    /// cannot hold them.
    pub(super) async fn allocate(
        &self,
        number: usize,
    ) -> Result<Range<i64>, ShardError> {
        let n = i64::try_from(number)
            .ok()
            .filter(|n| *n <= self.task_ids.range_size())
            .ok_or_else(|| {
                ShardError::InvalidArgument(format!(
                    "cannot allocate {} task IDs from ranges of {}",
                    number,
                    self.task_ids.range_size()
                ))
            })?;
        loop {
            self.ensure_verified().await?;
            self.check_active()?;
            match self.task_ids.try_allocate(n) {
                Ok(ids) => {
                    // The lease may have been taken while allocating.
                    self.check_active()?;
                    return Ok(ids);
                }
                Err(exhausted) => self.renew_range(exhausted).await?,
            }
        }
    }

    fn known_cluster(&self, cluster: &str) -> Result<(), ShardError> {
        if self.cluster_metadata.is_known_cluster(cluster) {
            Ok(())
        } else {
            Err(ShardError::InvalidArgument(format!(
                "unknown cluster {}",
                cluster
            )))
        }
    }
}

#[async_trait]
impl TaskIdSource for ShardContext {
    async fn generate_task_id(&self) -> Result<i64, ShardError> {
        Ok(self.allocate(1).await?.start)
    }

    async fn generate_task_ids(
        &self,
        number: usize,
    ) -> Result<Vec<i64>, ShardError> {
        self.check_active()?;
        if number == 0 {
            return Ok(Vec::new());
        }
        Ok(self.allocate(number).await?.collect())
    }
}

#[async_trait]
impl VectorClockSource for ShardContext {
    async fn new_vector_clock(&self) -> Result<VectorClock, ShardError> {
        let clock = self.generate_task_id().await?;
        Ok(VectorClock::new(
            self.cluster_metadata.current_cluster_id(),
            self.shard_id,
            clock,
        ))
    }

    fn current_vector_clock(&self) -> Result<VectorClock, ShardError> {
        self.check_active()?;
        Ok(VectorClock::new(
            self.cluster_metadata.current_cluster_id(),
            self.shard_id,
            self.task_ids.peek_next() - 1,
        ))
    }
}

#[async_trait]
impl QueueStateStore for ShardContext {
    fn get_queue_exclusive_high_read_watermark(
        &self,
        category: TaskCategory,
    ) -> Result<TaskKey, ShardError> {
        self.check_active()?;
        Ok(self.queues.exclusive_high_watermark(
            category,
            self.task_ids.peek_next(),
            Utc::now(),
        ))
    }

    fn get_queue_state(
        &self,
        category: TaskCategory,
    ) -> Result<Option<QueueState>, ShardError> {
        self.check_active()?;
        Ok(self.queues.get(category))
    }

    async fn set_queue_state(
        &self,
        category: TaskCategory,
        tasks_completed: usize,
        state: QueueState,
    ) -> Result<(), ShardError> {
        self.check_active()?;
        self.queues.set(category, state)?;
        if self.queues.record_completed(tasks_completed) {
            self.persist_shard_info().await?;
        }
        Ok(())
    }

    async fn update_replication_queue_reader_state(
        &self,
        reader_id: i64,
        state: QueueReaderState,
    ) -> Result<(), ShardError> {
        self.check_active()?;
        let (cluster_id, _) = reader_cluster_and_shard(reader_id);
        if self.cluster_metadata.cluster_name(cluster_id).is_none() {
            return Err(ShardError::InvalidArgument(format!(
                "reader {} belongs to unknown cluster {}",
                reader_id, cluster_id
            )));
        }
        self.queues
            .set_reader(TaskCategory::REPLICATION, reader_id, state)?;
        if self.queues.record_completed(0) {
            self.persist_shard_info().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ReplicationProgress for ShardContext {
    fn get_replicator_dlq_ack_level(
        &self,
        source_cluster: &str,
    ) -> Result<i64, ShardError> {
        self.check_active()?;
        Ok(self.replication.dlq_ack_level(source_cluster))
    }

    async fn update_replicator_dlq_ack_level(
        &self,
        source_cluster: &str,
        ack_level: i64,
    ) -> Result<(), ShardError> {
        self.check_active()?;
        if self.replication.update_dlq_ack_level(source_cluster, ack_level) {
            self.persist_shard_info().await?;
        }
        Ok(())
    }

    fn update_remote_cluster_info(
        &self,
        cluster: &str,
        ack_task_id: i64,
        ack_time: DateTime<Utc>,
    ) -> Result<(), ShardError> {
        self.check_active()?;
        self.known_cluster(cluster)?;
        self.replication
            .update_remote_ack(cluster, self.shard_id, ack_task_id, ack_time);
        Ok(())
    }

    fn update_remote_reader_info(
        &self,
        reader_id: i64,
        ack_task_id: i64,
        ack_time: DateTime<Utc>,
    ) -> Result<(), ShardError> {
        self.check_active()?;
        let (cluster_id, remote_shard) = reader_cluster_and_shard(reader_id);
        let cluster =
            self.cluster_metadata.cluster_name(cluster_id).ok_or_else(|| {
                ShardError::InvalidArgument(format!(
                    "reader {} belongs to unknown cluster {}",
                    reader_id, cluster_id
                ))
            })?;
        self.replication
            .update_remote_ack(&cluster, remote_shard, ack_task_id, ack_time);
        Ok(())
    }

    fn set_current_time(
        &self,
        cluster: &str,
        time: DateTime<Utc>,
    ) -> Result<(), ShardError> {
        self.check_active()?;
        if cluster == self.cluster_metadata.current_cluster_name() {
            return Err(ShardError::InvalidArgument(format!(
                "cannot set the time of the current cluster {}",
                cluster
            )));
        }
        self.known_cluster(cluster)?;
        self.replication.set_remote_time(cluster, time);
        Ok(())
    }

    fn get_current_time(
        &self,
        cluster: &str,
    ) -> Result<DateTime<Utc>, ShardError> {
        self.check_active()?;
        if cluster == self.cluster_metadata.current_cluster_name() {
            return Ok(Utc::now());
        }
        Ok(self
            .replication
            .remote_time(cluster)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH))
    }

    fn get_replication_status(
        &self,
        clusters: &[String],
    ) -> Result<ReplicationStatus, ShardError> {
        self.check_active()?;
        Ok(self
            .replication
            .status(|c| clusters.is_empty() || clusters.iter().any(|x| x == c)))
    }

    fn update_handover_namespace(
        &self,
        namespace: &Namespace,
        deleted_from_storage: bool,
    ) -> Result<(), ShardError> {
        let category = TaskCategory::REPLICATION;
        let watermark = self.get_queue_exclusive_high_read_watermark(category)?;
        if self.replication.update_handover(
            namespace,
            deleted_from_storage,
            watermark.task_id - 1,
        ) {
            debug!(
                "shard {}: handover of {} now at replication task {}",
                self.shard_id,
                namespace.name,
                watermark.task_id - 1
            );
        }
        Ok(())
    }
}
