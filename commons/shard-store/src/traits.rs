use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::StoreError;
use crate::requests::*;
use crate::types::{HistoryEvent, HistoryTask, ShardId, ShardInfo};

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable shard records with range-fenced conditional updates.
#[async_trait]
pub trait ShardStore: Send + Sync {
    /// Reads the shard record, creating it with range ID 0 when absent.
    async fn get_or_create_shard(
        &self,
        shard_id: ShardId,
        initial_owner: &str,
    ) -> StoreResult<ShardInfo>;

    async fn get_shard(&self, shard_id: ShardId) -> StoreResult<ShardInfo>;

    /// Replaces the record only if the stored range ID still equals
    /// `previous_range_id`.
    async fn update_shard(&self, request: UpdateShardRequest)
        -> StoreResult<()>;

    /// Change feed of the persisted range ID. Engines with native watches
    /// return a receiver; the default has none and ownership loss is then
    /// only discovered by a rejected write.
    fn subscribe_range(
        &self,
        _shard_id: ShardId,
    ) -> Option<watch::Receiver<i64>> {
        None
    }
}

/// Workflow execution, history and task persistence for one shard.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowExecutionRequest,
    ) -> StoreResult<CreateWorkflowExecutionResponse>;

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> StoreResult<UpdateWorkflowExecutionResponse>;

    async fn conflict_resolve_workflow_execution(
        &self,
        request: ConflictResolveWorkflowExecutionRequest,
    ) -> StoreResult<ConflictResolveWorkflowExecutionResponse>;

    async fn set_workflow_execution(
        &self,
        request: SetWorkflowExecutionRequest,
    ) -> StoreResult<SetWorkflowExecutionResponse>;

    async fn get_current_execution(
        &self,
        request: GetCurrentExecutionRequest,
    ) -> StoreResult<GetCurrentExecutionResponse>;

    async fn get_workflow_execution(
        &self,
        request: GetWorkflowExecutionRequest,
    ) -> StoreResult<GetWorkflowExecutionResponse>;

    async fn delete_current_workflow_execution(
        &self,
        request: DeleteCurrentWorkflowExecutionRequest,
    ) -> StoreResult<()>;

    async fn delete_workflow_execution(
        &self,
        request: DeleteWorkflowExecutionRequest,
    ) -> StoreResult<()>;

    async fn delete_history_branch(
        &self,
        request: DeleteHistoryBranchRequest,
    ) -> StoreResult<()>;

    async fn append_history_nodes(
        &self,
        request: AppendHistoryNodesRequest,
    ) -> StoreResult<AppendHistoryNodesResponse>;

    async fn read_history_branch(
        &self,
        shard_id: ShardId,
        branch_token: &[u8],
    ) -> StoreResult<Vec<HistoryEvent>>;

    async fn add_history_tasks(
        &self,
        request: AddHistoryTasksRequest,
    ) -> StoreResult<()>;

    async fn get_history_tasks(
        &self,
        request: GetHistoryTasksRequest,
    ) -> StoreResult<Vec<HistoryTask>>;
}

/// Everything a shard context needs from the storage engine.
pub trait ShardPersistence: ShardStore + ExecutionStore {}

impl<T: ShardStore + ExecutionStore> ShardPersistence for T {}
