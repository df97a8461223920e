use std::future::Future;

use chrono::{DateTime, Utc};
use shard_store::{
    AddHistoryTasksRequest, AppendHistoryNodesRequest, CategoryKind,
    ConflictResolveWorkflowExecutionRequest,
    ConflictResolveWorkflowExecutionResponse, CreateWorkflowExecutionRequest,
    CreateWorkflowExecutionResponse, DeleteCurrentWorkflowExecutionRequest,
    DeleteHistoryBranchRequest, DeleteWorkflowExecutionRequest,
    GetCurrentExecutionRequest, GetCurrentExecutionResponse,
    GetWorkflowExecutionRequest, GetWorkflowExecutionResponse, HistoryTask,
    SetWorkflowExecutionRequest, SetWorkflowExecutionResponse, StoreResult,
    TaskCategory, TaskKey, TaskType, UpdateWorkflowExecutionRequest,
    UpdateWorkflowExecutionResponse, WorkflowKey,
};
use tracing::debug;

use crate::error::ShardError;

use super::context::ShardContext;
use super::queue::QueueStateTracker;

/// Steps of a workflow deletion, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStage {
    VisibilityTaskAdded,
    CurrentDeleted,
    MutableStateDeleted,
    HistoryDeleted,
}

impl DeleteStage {
    #[inline]
    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Progress of a deletion. Callers keep it across retries so finished
/// steps are not repeated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteWorkflowExecutionStage(u8);

impl DeleteWorkflowExecutionStage {
    #[inline]
    pub fn is_processed(&self, stage: DeleteStage) -> bool {
        self.0 & stage.bit() != 0
    }

    #[inline]
    pub fn mark_processed(&mut self, stage: DeleteStage) {
        self.0 |= stage.bit();
    }
}

/// Task keys registered with the queue tracker until the write carrying
/// them has finished, successfully or not.
pub(super) struct PendingTasks<'a> {
    queues: &'a QueueStateTracker,
    keys: Vec<(TaskCategory, TaskKey)>,
}

impl<'a> PendingTasks<'a> {
    fn new(queues: &'a QueueStateTracker) -> Self {
        Self {
            queues,
            keys: Vec::new(),
        }
    }

    fn add(&mut self, category: TaskCategory, key: TaskKey) -> TaskKey {
        let key = self.queues.add_pending(category, key);
        self.keys.push((category, key));
        key
    }
}

impl Drop for PendingTasks<'_> {
    fn drop(&mut self) {
        for (category, key) in self.keys.drain(..) {
            self.queues.remove_pending(category, &key);
        }
    }
}

impl ShardContext {
    /// Assigns task IDs to every task and registers their keys as pending.
    /// Scheduled tasks keep their fire time unless it falls below a
    /// watermark already handed out.
    pub(super) async fn assign_task_keys(
        &self,
        task_lists: &mut [&mut Vec<HistoryTask>],
    ) -> Result<PendingTasks<'_>, ShardError> {
        let mut pending = PendingTasks::new(&self.queues);
        let count: usize = task_lists.iter().map(|tasks| tasks.len()).sum();
        if count == 0 {
            return Ok(pending);
        }

        let mut immediate: Vec<TaskCategory> = task_lists
            .iter()
            .flat_map(|tasks| tasks.iter().map(|t| t.category()))
            .filter(|c| c.kind() == CategoryKind::Immediate)
            .collect();
        immediate.sort_by_key(|c| c.id());
        immediate.dedup();
        // Holds immediate watermarks below every ID issued next.
        let floor = TaskKey::immediate(self.task_ids.peek_next());
        let mut placeholders = PendingTasks::new(&self.queues);
        for category in immediate {
            placeholders.add(category, floor);
        }

        let ids = self.allocate(count).await?;
        for (task, id) in task_lists
            .iter_mut()
            .flat_map(|tasks| tasks.iter_mut())
            .zip(ids)
        {
            let category = task.category();
            let key = match category.kind() {
                CategoryKind::Immediate => TaskKey::immediate(id),
                CategoryKind::Scheduled => TaskKey::new(task.key.fire_time, id),
            };
            task.key = pending.add(category, key);
        }
        drop(placeholders);
        Ok(pending)
    }

    /// Runs `write` with the current range ID once ownership is confirmed.
    async fn fenced_write<T, W, Fut>(
        &self,
        op: &'static str,
        write: W,
    ) -> Result<T, ShardError>
    where
        W: FnOnce(i64) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.check_active()?;
        self.ensure_verified().await?;
        let _range = self.range_lock.read().await;
        self.check_active()?;
        let range_id = self.task_ids.range_id();
        self.fenced(op, write(range_id)).await
    }

    pub async fn create_workflow_execution(
        &self,
        mut request: CreateWorkflowExecutionRequest,
    ) -> Result<CreateWorkflowExecutionResponse, ShardError> {
        self.check_active()?;
        self.ensure_verified().await?;
        let _pending =
            self.assign_task_keys(&mut [&mut request.new_tasks]).await?;
        request.shard_id = self.shard_id;
        self.fenced_write("create_workflow_execution", |range_id| {
            request.range_id = range_id;
            self.store.create_workflow_execution(request)
        })
        .await
    }

    pub async fn update_workflow_execution(
        &self,
        mut request: UpdateWorkflowExecutionRequest,
    ) -> Result<UpdateWorkflowExecutionResponse, ShardError> {
        self.check_active()?;
        self.ensure_verified().await?;
        let _pending = self
            .assign_task_keys(&mut [
                &mut request.update_tasks,
                &mut request.new_tasks,
            ])
            .await?;
        request.shard_id = self.shard_id;
        self.fenced_write("update_workflow_execution", |range_id| {
            request.range_id = range_id;
            self.store.update_workflow_execution(request)
        })
        .await
    }

    pub async fn conflict_resolve_workflow_execution(
        &self,
        mut request: ConflictResolveWorkflowExecutionRequest,
    ) -> Result<ConflictResolveWorkflowExecutionResponse, ShardError> {
        self.check_active()?;
        self.ensure_verified().await?;
        let _pending = self
            .assign_task_keys(&mut [
                &mut request.reset_tasks,
                &mut request.new_tasks,
                &mut request.current_tasks,
            ])
            .await?;
        request.shard_id = self.shard_id;
        self.fenced_write("conflict_resolve_workflow_execution", |range_id| {
            request.range_id = range_id;
            self.store.conflict_resolve_workflow_execution(request)
        })
        .await
    }

    pub async fn set_workflow_execution(
        &self,
        mut request: SetWorkflowExecutionRequest,
    ) -> Result<SetWorkflowExecutionResponse, ShardError> {
        request.shard_id = self.shard_id;
        self.fenced_write("set_workflow_execution", |range_id| {
            request.range_id = range_id;
            self.store.set_workflow_execution(request)
        })
        .await
    }

    pub async fn get_current_execution(
        &self,
        mut request: GetCurrentExecutionRequest,
    ) -> Result<GetCurrentExecutionResponse, ShardError> {
        self.check_active()?;
        request.shard_id = self.shard_id;
        let fut = self.store.get_current_execution(request);
        self.read("get_current_execution", fut).await
    }

    pub async fn get_workflow_execution(
        &self,
        mut request: GetWorkflowExecutionRequest,
    ) -> Result<GetWorkflowExecutionResponse, ShardError> {
        self.check_active()?;
        request.shard_id = self.shard_id;
        let fut = self.store.get_workflow_execution(request);
        self.read("get_workflow_execution", fut).await
    }

    /// Persists standalone tasks for a workflow.
    pub async fn add_tasks(
        &self,
        mut request: AddHistoryTasksRequest,
    ) -> Result<(), ShardError> {
        self.check_active()?;
        self.ensure_verified().await?;
        let _pending = self.assign_task_keys(&mut [&mut request.tasks]).await?;
        request.shard_id = self.shard_id;
        self.fenced_write("add_history_tasks", |range_id| {
            request.range_id = range_id;
            self.store.add_history_tasks(request)
        })
        .await
    }

    /// Appends a history node and returns its encoded size.
    pub async fn append_history_events(
        &self,
        mut request: AppendHistoryNodesRequest,
        workflow: &WorkflowKey,
    ) -> Result<usize, ShardError> {
        request.shard_id = self.shard_id;
        let node_id = request.node_id;
        let response = self
            .fenced_write("append_history_nodes", |range_id| {
                request.range_id = range_id;
                self.store.append_history_nodes(request)
            })
            .await?;
        debug!(
            "shard {}: appended node {} of {} ({} bytes)",
            self.shard_id, node_id, workflow, response.size
        );
        Ok(response.size)
    }

    /// Deletes a workflow run step by step, skipping the steps `stage`
    /// already records. Each finished step is recorded before the next one
    /// starts, so a failed call can be retried with the same `stage`.
    pub async fn delete_workflow_execution(
        &self,
        key: &WorkflowKey,
        branch_token: Option<&[u8]>,
        close_visibility_task_id: i64,
        close_time: Option<DateTime<Utc>>,
        stage: &mut DeleteWorkflowExecutionStage,
    ) -> Result<(), ShardError> {
        if !stage.is_processed(DeleteStage::VisibilityTaskAdded) {
            let task = HistoryTask::new(
                TaskType::DeleteExecutionVisibility {
                    close_visibility_task_id,
                    close_time,
                },
                key.clone(),
            );
            self.add_tasks(AddHistoryTasksRequest {
                namespace_id: key.namespace_id.clone(),
                workflow_id: key.workflow_id.clone(),
                tasks: vec![task],
                ..Default::default()
            })
            .await?;
            stage.mark_processed(DeleteStage::VisibilityTaskAdded);
        }

        if !stage.is_processed(DeleteStage::CurrentDeleted) {
            self.fenced_write("delete_current_workflow_execution", |range_id| {
                self.store.delete_current_workflow_execution(
                    DeleteCurrentWorkflowExecutionRequest {
                        shard_id: self.shard_id,
                        range_id,
                        key: key.clone(),
                    },
                )
            })
            .await?;
            stage.mark_processed(DeleteStage::CurrentDeleted);
        }

        if !stage.is_processed(DeleteStage::MutableStateDeleted) {
            self.fenced_write("delete_workflow_execution", |range_id| {
                self.store
                    .delete_workflow_execution(DeleteWorkflowExecutionRequest {
                        shard_id: self.shard_id,
                        range_id,
                        key: key.clone(),
                    })
            })
            .await?;
            stage.mark_processed(DeleteStage::MutableStateDeleted);
        }

        if let Some(branch_token) = branch_token {
            if !stage.is_processed(DeleteStage::HistoryDeleted) {
                self.fenced_write("delete_history_branch", |range_id| {
                    let request = DeleteHistoryBranchRequest {
                        shard_id: self.shard_id,
                        range_id,
                        branch_token: branch_token.to_vec(),
                    };
                    self.store.delete_history_branch(request)
                })
                .await?;
            }
        }
        stage.mark_processed(DeleteStage::HistoryDeleted);
        debug!("shard {}: deleted workflow {}", self.shard_id, key);
        Ok(())
    }

    /// Keeps a workflow task timeout in memory only. The task gets a task ID
    /// but is never persisted; it surfaces through
    /// [`take_due_speculative_timeouts`](Self::take_due_speculative_timeouts).
    pub async fn add_speculative_workflow_task_timeout_task(
        &self,
        mut task: HistoryTask,
    ) -> Result<TaskKey, ShardError> {
        if task.task_type != TaskType::WorkflowTaskTimeout {
            return Err(ShardError::InvalidArgument(format!(
                "{:?} cannot be speculative",
                task.task_type
            )));
        }
        let id = self.allocate(1).await?.start;
        task.key = TaskKey::new(task.key.fire_time, id);
        let key = task.key;
        let mut timeouts = self
            .speculative
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        timeouts.insert(key, task);
        Ok(key)
    }

    /// Removes and returns the speculative timeouts firing at or before
    /// `now`, in key order.
    pub fn take_due_speculative_timeouts(
        &self,
        now: DateTime<Utc>,
    ) -> Vec<HistoryTask> {
        let mut timeouts = self
            .speculative
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let later = timeouts.split_off(&TaskKey::new(now, i64::MAX));
        let due = std::mem::replace(&mut *timeouts, later);
        due.into_values().collect()
    }
}
