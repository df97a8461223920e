//! Request and response records exchanged with the storage engine.
//!
//! Every mutating request carries the caller's `range_id`; the engine
//! rejects it with [`StoreError::ShardOwnershipLost`](crate::StoreError)
//! when that range has been superseded.

use crate::types::{
    HistoryEvent, HistoryTask, ShardId, ShardInfo, TaskRange, WorkflowKey,
    WorkflowSnapshot, WorkflowState,
};

#[derive(Debug, Clone)]
pub struct UpdateShardRequest {
    pub shard_info: ShardInfo,
    pub previous_range_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CreateWorkflowMode {
    /// Fails when the workflow ID already has a current run.
    #[default]
    BrandNew,
    /// Replaces a closed current run.
    UpdateCurrent {
        previous_run_id: String,
        previous_last_write_version: i64,
    },
    /// Writes the run without touching the current record (zombie).
    BypassCurrent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateWorkflowMode {
    #[default]
    UpdateCurrent,
    BypassCurrent,
}

#[derive(Debug, Clone, Default)]
pub struct CreateWorkflowExecutionRequest {
    pub shard_id: ShardId,
    pub range_id: i64,
    pub mode: CreateWorkflowMode,
    pub new_snapshot: WorkflowSnapshot,
    pub new_tasks: Vec<HistoryTask>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateWorkflowExecutionResponse {
    pub db_record_version: i64,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateWorkflowExecutionRequest {
    pub shard_id: ShardId,
    pub range_id: i64,
    pub mode: UpdateWorkflowMode,
    pub update_mutation: WorkflowSnapshot,
    pub update_tasks: Vec<HistoryTask>,
    pub new_snapshot: Option<WorkflowSnapshot>,
    pub new_tasks: Vec<HistoryTask>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateWorkflowExecutionResponse {
    pub db_record_version: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ConflictResolveWorkflowExecutionRequest {
    pub shard_id: ShardId,
    pub range_id: i64,
    pub reset_snapshot: WorkflowSnapshot,
    pub reset_tasks: Vec<HistoryTask>,
    pub new_snapshot: Option<WorkflowSnapshot>,
    pub new_tasks: Vec<HistoryTask>,
    pub current_mutation: Option<WorkflowSnapshot>,
    pub current_tasks: Vec<HistoryTask>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictResolveWorkflowExecutionResponse {
    pub current_run_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct SetWorkflowExecutionRequest {
    pub shard_id: ShardId,
    pub range_id: i64,
    pub set_snapshot: WorkflowSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetWorkflowExecutionResponse {
    pub db_record_version: i64,
}

#[derive(Debug, Clone, Default)]
pub struct GetCurrentExecutionRequest {
    pub shard_id: ShardId,
    pub namespace_id: String,
    pub workflow_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetCurrentExecutionResponse {
    pub run_id: String,
    pub state: WorkflowState,
    pub last_write_version: i64,
}

#[derive(Debug, Clone, Default)]
pub struct GetWorkflowExecutionRequest {
    pub shard_id: ShardId,
    pub key: WorkflowKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetWorkflowExecutionResponse {
    pub state: WorkflowSnapshot,
    pub db_record_version: i64,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteCurrentWorkflowExecutionRequest {
    pub shard_id: ShardId,
    pub range_id: i64,
    pub key: WorkflowKey,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteWorkflowExecutionRequest {
    pub shard_id: ShardId,
    pub range_id: i64,
    pub key: WorkflowKey,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteHistoryBranchRequest {
    pub shard_id: ShardId,
    pub range_id: i64,
    pub branch_token: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct AppendHistoryNodesRequest {
    pub shard_id: ShardId,
    pub range_id: i64,
    pub branch_token: Vec<u8>,
    pub node_id: i64,
    pub transaction_id: i64,
    pub is_new_branch: bool,
    pub events: Vec<HistoryEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendHistoryNodesResponse {
    /// Encoded size of the appended node in bytes.
    pub size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AddHistoryTasksRequest {
    pub shard_id: ShardId,
    pub range_id: i64,
    pub namespace_id: String,
    pub workflow_id: String,
    pub tasks: Vec<HistoryTask>,
}

#[derive(Debug, Clone)]
pub struct GetHistoryTasksRequest {
    pub shard_id: ShardId,
    pub category_id: i32,
    pub range: TaskRange,
    pub batch_size: usize,
}
