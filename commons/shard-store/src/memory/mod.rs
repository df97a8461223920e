use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use scc::hash_map::Entry::{Occupied, Vacant};
use tokio::sync::{watch, RwLock};
use tracing::debug;

use crate::error::StoreError;
use crate::requests::*;
use crate::traits::*;
use crate::types::{
    HistoryEvent, HistoryTask, ShardId, ShardInfo, TaskKey, WorkflowKey,
    WorkflowSnapshot, WorkflowState,
};

#[derive(Debug, Clone, Copy)]
struct InjectedFault {
    remaining: usize,
    apply_before_failing: bool,
}

#[derive(Debug, Clone)]
struct CurrentRecord {
    run_id: String,
    state: WorkflowState,
    last_write_version: i64,
}

impl From<&WorkflowSnapshot> for CurrentRecord {
    fn from(snapshot: &WorkflowSnapshot) -> Self {
        Self {
            run_id: snapshot.key.run_id.clone(),
            state: snapshot.state,
            last_write_version: snapshot.last_write_version,
        }
    }
}

#[derive(Debug, Clone)]
struct HistoryNode {
    transaction_id: i64,
    blob: Vec<u8>,
}

type CurrentKey = (ShardId, String, String);

#[derive(Default)]
struct Tables {
    shards: HashMap<ShardId, ShardInfo>,
    current: HashMap<CurrentKey, CurrentRecord>,
    executions: HashMap<(ShardId, WorkflowKey), WorkflowSnapshot>,
    tasks: HashMap<(ShardId, i32), BTreeMap<TaskKey, HistoryTask>>,
    history: HashMap<(ShardId, Vec<u8>), BTreeMap<i64, HistoryNode>>,
}

fn current_key(shard_id: ShardId, key: &WorkflowKey) -> CurrentKey {
    (shard_id, key.namespace_id.clone(), key.workflow_id.clone())
}

impl Tables {
    fn check_range(&self, shard_id: ShardId, range_id: i64) -> StoreResult<()> {
        match self.shards.get(&shard_id) {
            None => Err(StoreError::NotFound(format!("shard {}", shard_id))),
            Some(info) if info.range_id != range_id => {
                Err(StoreError::ShardOwnershipLost {
                    shard_id,
                    request_range_id: range_id,
                    current_range_id: info.range_id,
                })
            }
            Some(_) => Ok(()),
        }
    }

    fn check_version(
        &self,
        shard_id: ShardId,
        snapshot: &WorkflowSnapshot,
    ) -> StoreResult<()> {
        let stored = self
            .executions
            .get(&(shard_id, snapshot.key.clone()))
            .ok_or_else(|| {
                StoreError::NotFound(format!("workflow {}", snapshot.key))
            })?;
        if stored.db_record_version + 1 != snapshot.db_record_version {
            return Err(StoreError::ConditionFailed(format!(
                "workflow {}: stored record version {}, write produces {}",
                snapshot.key,
                stored.db_record_version,
                snapshot.db_record_version
            )));
        }
        Ok(())
    }

    fn check_absent(
        &self,
        shard_id: ShardId,
        snapshot: &WorkflowSnapshot,
    ) -> StoreResult<()> {
        if self
            .executions
            .contains_key(&(shard_id, snapshot.key.clone()))
        {
            return Err(StoreError::AlreadyExists(format!(
                "workflow {}",
                snapshot.key
            )));
        }
        Ok(())
    }

    fn check_is_current(
        &self,
        shard_id: ShardId,
        key: &WorkflowKey,
    ) -> StoreResult<()> {
        match self.current.get(&current_key(shard_id, key)) {
            Some(cur) if cur.run_id == key.run_id => Ok(()),
            Some(cur) => Err(StoreError::ConditionFailed(format!(
                "workflow {}: current run is {}",
                key, cur.run_id
            ))),
            None => Err(StoreError::ConditionFailed(format!(
                "workflow {}: no current run",
                key
            ))),
        }
    }

    fn put_execution(&mut self, shard_id: ShardId, snapshot: WorkflowSnapshot) {
        self.executions
            .insert((shard_id, snapshot.key.clone()), snapshot);
    }

    fn put_current(&mut self, shard_id: ShardId, snapshot: &WorkflowSnapshot) {
        self.current
            .insert(current_key(shard_id, &snapshot.key), snapshot.into());
    }

    fn put_tasks<I>(&mut self, shard_id: ShardId, tasks: I)
    where
        I: IntoIterator<Item = HistoryTask>,
    {
        for task in tasks {
            self.tasks
                .entry((shard_id, task.category().id()))
                .or_default()
                .insert(task.key, task);
        }
    }
}

/// In-process storage engine. Enforces the same range fencing as a real
/// engine and publishes range changes through [`ShardStore::subscribe_range`].
#[derive(Clone, Default)]
pub struct MemoryShardStore {
    tables: Arc<RwLock<Tables>>,
    range_feeds: Arc<scc::HashMap<ShardId, watch::Sender<i64>>>,
    feedless: bool,
    fault: Arc<Mutex<Option<InjectedFault>>>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl MemoryShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store without a range feed, like engines that lack watches.
    /// Ownership loss then only shows up on a rejected write or a re-read.
    pub fn without_range_feed() -> Self {
        Self {
            feedless: true,
            ..Self::default()
        }
    }

    /// Holds the next write for `delay` before it touches any table.
    pub fn delay_next_write(&self, delay: Duration) {
        let mut slot = self.delay.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(delay);
    }

    /// Makes the next `count` writes fail with a timeout. With
    /// `apply_before_failing` the write lands before the error is returned,
    /// which is the ambiguous case callers must handle.
    pub fn inject_write_timeouts(
        &self,
        count: usize,
        apply_before_failing: bool,
    ) {
        let mut fault = self.fault.lock().unwrap_or_else(|e| e.into_inner());
        *fault = Some(InjectedFault {
            remaining: count,
            apply_before_failing,
        });
    }

    fn take_fault(&self) -> Option<bool> {
        let mut guard = self.fault.lock().unwrap_or_else(|e| e.into_inner());
        let fault = guard.as_mut()?;
        if fault.remaining == 0 {
            *guard = None;
            return None;
        }
        fault.remaining -= 1;
        Some(fault.apply_before_failing)
    }

    fn publish_range(&self, shard_id: ShardId, range_id: i64) {
        match self.range_feeds.entry_sync(shard_id) {
            Occupied(occupied) => {
                occupied.get().send_replace(range_id);
            }
            Vacant(vacant) => {
                vacant.insert_entry(watch::channel(range_id).0);
            }
        }
    }

    async fn write<R, F>(&self, op: &str, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut Tables) -> StoreResult<R> + Send,
        R: Send,
    {
        let delay = self
            .delay
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let fault = self.take_fault();
        if fault == Some(false) {
            return Err(StoreError::Timeout(format!("{} timed out", op)));
        }
        let out = {
            let mut tables = self.tables.write().await;
            f(&mut tables)?
        };
        if fault == Some(true) {
            return Err(StoreError::Timeout(format!(
                "{} timed out after apply",
                op
            )));
        }
        Ok(out)
    }
}

#[async_trait]
impl ShardStore for MemoryShardStore {
    async fn get_or_create_shard(
        &self,
        shard_id: ShardId,
        initial_owner: &str,
    ) -> StoreResult<ShardInfo> {
        let owner = initial_owner.to_string();
        let info = self
            .write("get_or_create_shard", move |tables| {
                let info = tables
                    .shards
                    .entry(shard_id)
                    .or_insert_with(|| ShardInfo::new(shard_id, owner));
                Ok(info.clone())
            })
            .await?;
        self.publish_range(shard_id, info.range_id);
        Ok(info)
    }

    async fn get_shard(&self, shard_id: ShardId) -> StoreResult<ShardInfo> {
        let tables = self.tables.read().await;
        tables
            .shards
            .get(&shard_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("shard {}", shard_id)))
    }

    async fn update_shard(
        &self,
        request: UpdateShardRequest,
    ) -> StoreResult<()> {
        let shard_id = request.shard_info.shard_id;
        let result = self
            .write("update_shard", move |tables| {
                let stored = tables.shards.get_mut(&shard_id).ok_or_else(|| {
                    StoreError::NotFound(format!("shard {}", shard_id))
                })?;
                if stored.range_id != request.previous_range_id {
                    return Err(StoreError::ShardOwnershipLost {
                        shard_id,
                        request_range_id: request.previous_range_id,
                        current_range_id: stored.range_id,
                    });
                }
                let mut next = request.shard_info;
                next.updated_at = Utc::now();
                *stored = next;
                Ok(stored.range_id)
            })
            .await;
        // A write that timed out after applying still moves the feed.
        if let Ok(stored) = self.get_shard(shard_id).await {
            self.publish_range(shard_id, stored.range_id);
        }
        let range_id = result?;
        debug!("shard {}: stored record at range {}", shard_id, range_id);
        Ok(())
    }

    fn subscribe_range(
        &self,
        shard_id: ShardId,
    ) -> Option<watch::Receiver<i64>> {
        if self.feedless {
            return None;
        }
        let feed = self
            .range_feeds
            .entry_sync(shard_id)
            .or_insert_with(|| watch::channel(0).0);
        Some(feed.get().subscribe())
    }
}

#[async_trait]
impl ExecutionStore for MemoryShardStore {
    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowExecutionRequest,
    ) -> StoreResult<CreateWorkflowExecutionResponse> {
        self.write("create_workflow_execution", move |tables| {
            let shard_id = request.shard_id;
            tables.check_range(shard_id, request.range_id)?;
            let snapshot = request.new_snapshot;
            let ck = current_key(shard_id, &snapshot.key);
            match &request.mode {
                CreateWorkflowMode::BrandNew => {
                    if let Some(cur) = tables.current.get(&ck) {
                        return Err(StoreError::AlreadyExists(format!(
                            "workflow {} has current run {}",
                            snapshot.key.workflow_id, cur.run_id
                        )));
                    }
                }
                CreateWorkflowMode::UpdateCurrent {
                    previous_run_id,
                    previous_last_write_version,
                } => match tables.current.get(&ck) {
                    Some(cur)
                        if &cur.run_id == previous_run_id
                            && cur.last_write_version
                                == *previous_last_write_version
                            && cur.state == WorkflowState::Completed => {}
                    Some(cur) => {
                        return Err(StoreError::ConditionFailed(format!(
                            "workflow {}: current run {} ({:?}) is not {}",
                            snapshot.key.workflow_id,
                            cur.run_id,
                            cur.state,
                            previous_run_id
                        )));
                    }
                    None => {
                        return Err(StoreError::ConditionFailed(format!(
                            "workflow {}: no current run",
                            snapshot.key.workflow_id
                        )));
                    }
                },
                CreateWorkflowMode::BypassCurrent => {}
            }
            tables.check_absent(shard_id, &snapshot)?;

            let db_record_version = snapshot.db_record_version;
            if request.mode != CreateWorkflowMode::BypassCurrent {
                tables.put_current(shard_id, &snapshot);
            }
            tables.put_execution(shard_id, snapshot);
            tables.put_tasks(shard_id, request.new_tasks);
            Ok(CreateWorkflowExecutionResponse { db_record_version })
        })
        .await
    }

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> StoreResult<UpdateWorkflowExecutionResponse> {
        self.write("update_workflow_execution", move |tables| {
            let shard_id = request.shard_id;
            tables.check_range(shard_id, request.range_id)?;
            let mutation = request.update_mutation;
            tables.check_version(shard_id, &mutation)?;
            let update_current =
                request.mode == UpdateWorkflowMode::UpdateCurrent;
            if update_current {
                tables.check_is_current(shard_id, &mutation.key)?;
            }
            if let Some(new) = &request.new_snapshot {
                tables.check_absent(shard_id, new)?;
            }

            let db_record_version = mutation.db_record_version;
            if update_current {
                match &request.new_snapshot {
                    Some(new) => tables.put_current(shard_id, new),
                    None => tables.put_current(shard_id, &mutation),
                }
            }
            tables.put_execution(shard_id, mutation);
            if let Some(new) = request.new_snapshot {
                tables.put_execution(shard_id, new);
            }
            tables.put_tasks(
                shard_id,
                request.update_tasks.into_iter().chain(request.new_tasks),
            );
            Ok(UpdateWorkflowExecutionResponse { db_record_version })
        })
        .await
    }

    async fn conflict_resolve_workflow_execution(
        &self,
        request: ConflictResolveWorkflowExecutionRequest,
    ) -> StoreResult<ConflictResolveWorkflowExecutionResponse> {
        self.write("conflict_resolve_workflow_execution", move |tables| {
            let shard_id = request.shard_id;
            tables.check_range(shard_id, request.range_id)?;
            let reset = request.reset_snapshot;
            tables.check_version(shard_id, &reset)?;
            if let Some(current) = &request.current_mutation {
                tables.check_version(shard_id, current)?;
            }
            if let Some(new) = &request.new_snapshot {
                tables.check_absent(shard_id, new)?;
            }

            let current_run_id = match &request.new_snapshot {
                Some(new) => {
                    tables.put_current(shard_id, new);
                    new.key.run_id.clone()
                }
                None => {
                    tables.put_current(shard_id, &reset);
                    reset.key.run_id.clone()
                }
            };
            tables.put_execution(shard_id, reset);
            if let Some(current) = request.current_mutation {
                tables.put_execution(shard_id, current);
            }
            if let Some(new) = request.new_snapshot {
                tables.put_execution(shard_id, new);
            }
            tables.put_tasks(
                shard_id,
                request
                    .reset_tasks
                    .into_iter()
                    .chain(request.new_tasks)
                    .chain(request.current_tasks),
            );
            Ok(ConflictResolveWorkflowExecutionResponse { current_run_id })
        })
        .await
    }

    async fn set_workflow_execution(
        &self,
        request: SetWorkflowExecutionRequest,
    ) -> StoreResult<SetWorkflowExecutionResponse> {
        self.write("set_workflow_execution", move |tables| {
            let shard_id = request.shard_id;
            tables.check_range(shard_id, request.range_id)?;
            let snapshot = request.set_snapshot;
            tables.check_version(shard_id, &snapshot)?;
            let ck = current_key(shard_id, &snapshot.key);
            if let Some(cur) = tables.current.get_mut(&ck) {
                if cur.run_id == snapshot.key.run_id {
                    *cur = CurrentRecord::from(&snapshot);
                }
            }
            let db_record_version = snapshot.db_record_version;
            tables.put_execution(shard_id, snapshot);
            Ok(SetWorkflowExecutionResponse { db_record_version })
        })
        .await
    }

    async fn get_current_execution(
        &self,
        request: GetCurrentExecutionRequest,
    ) -> StoreResult<GetCurrentExecutionResponse> {
        let tables = self.tables.read().await;
        let ck = (
            request.shard_id,
            request.namespace_id.clone(),
            request.workflow_id.clone(),
        );
        tables
            .current
            .get(&ck)
            .map(|cur| GetCurrentExecutionResponse {
                run_id: cur.run_id.clone(),
                state: cur.state,
                last_write_version: cur.last_write_version,
            })
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "current run of {}/{}",
                    request.namespace_id, request.workflow_id
                ))
            })
    }

    async fn get_workflow_execution(
        &self,
        request: GetWorkflowExecutionRequest,
    ) -> StoreResult<GetWorkflowExecutionResponse> {
        let tables = self.tables.read().await;
        tables
            .executions
            .get(&(request.shard_id, request.key.clone()))
            .map(|state| GetWorkflowExecutionResponse {
                db_record_version: state.db_record_version,
                state: state.clone(),
            })
            .ok_or_else(|| {
                StoreError::NotFound(format!("workflow {}", request.key))
            })
    }

    async fn delete_current_workflow_execution(
        &self,
        request: DeleteCurrentWorkflowExecutionRequest,
    ) -> StoreResult<()> {
        self.write("delete_current_workflow_execution", move |tables| {
            tables.check_range(request.shard_id, request.range_id)?;
            let ck = current_key(request.shard_id, &request.key);
            let is_current = tables
                .current
                .get(&ck)
                .is_some_and(|cur| cur.run_id == request.key.run_id);
            if is_current {
                tables.current.remove(&ck);
            }
            Ok(())
        })
        .await
    }

    async fn delete_workflow_execution(
        &self,
        request: DeleteWorkflowExecutionRequest,
    ) -> StoreResult<()> {
        self.write("delete_workflow_execution", move |tables| {
            tables.check_range(request.shard_id, request.range_id)?;
            tables.executions.remove(&(request.shard_id, request.key));
            Ok(())
        })
        .await
    }

    async fn delete_history_branch(
        &self,
        request: DeleteHistoryBranchRequest,
    ) -> StoreResult<()> {
        self.write("delete_history_branch", move |tables| {
            tables.check_range(request.shard_id, request.range_id)?;
            tables
                .history
                .remove(&(request.shard_id, request.branch_token));
            Ok(())
        })
        .await
    }

    async fn append_history_nodes(
        &self,
        request: AppendHistoryNodesRequest,
    ) -> StoreResult<AppendHistoryNodesResponse> {
        if request.events.is_empty() {
            return Err(StoreError::InvalidKey(format!(
                "history node {} has no events",
                request.node_id
            )));
        }
        let blob = bincode::serde::encode_to_vec(
            &request.events,
            bincode::config::standard(),
        )?;
        self.write("append_history_nodes", move |tables| {
            tables.check_range(request.shard_id, request.range_id)?;
            let branch = tables
                .history
                .entry((request.shard_id, request.branch_token))
                .or_default();
            if request.is_new_branch && !branch.is_empty() {
                return Err(StoreError::AlreadyExists(
                    "history branch".to_string(),
                ));
            }
            let size = blob.len();
            let replace = branch
                .get(&request.node_id)
                .is_none_or(|node| {
                    node.transaction_id < request.transaction_id
                });
            if replace {
                branch.insert(
                    request.node_id,
                    HistoryNode {
                        transaction_id: request.transaction_id,
                        blob,
                    },
                );
            }
            Ok(AppendHistoryNodesResponse { size })
        })
        .await
    }

    async fn read_history_branch(
        &self,
        shard_id: ShardId,
        branch_token: &[u8],
    ) -> StoreResult<Vec<HistoryEvent>> {
        let tables = self.tables.read().await;
        let branch = tables
            .history
            .get(&(shard_id, branch_token.to_vec()))
            .ok_or_else(|| StoreError::NotFound("history branch".to_string()))?;
        let mut events = Vec::new();
        for node in branch.values() {
            let (decoded, _): (Vec<HistoryEvent>, usize) =
                bincode::serde::decode_from_slice(
                    &node.blob,
                    bincode::config::standard(),
                )?;
            events.extend(decoded);
        }
        Ok(events)
    }

    async fn add_history_tasks(
        &self,
        request: AddHistoryTasksRequest,
    ) -> StoreResult<()> {
        self.write("add_history_tasks", move |tables| {
            tables.check_range(request.shard_id, request.range_id)?;
            tables.put_tasks(request.shard_id, request.tasks);
            Ok(())
        })
        .await
    }

    async fn get_history_tasks(
        &self,
        request: GetHistoryTasksRequest,
    ) -> StoreResult<Vec<HistoryTask>> {
        if request.range.is_empty() {
            return Ok(Vec::new());
        }
        let bounds = request.range.inclusive_min..request.range.exclusive_max;
        let tables = self.tables.read().await;
        let tasks = tables
            .tasks
            .get(&(request.shard_id, request.category_id))
            .map(|queue| {
                queue
                    .range(bounds)
                    .take(request.batch_size)
                    .map(|(_, task)| task.clone())
                    .collect()
            })
            .unwrap_or_default();
        Ok(tasks)
    }
}
