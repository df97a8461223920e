mod queue;
mod shard;
mod task;
mod workflow;

pub use queue::{QueueReaderState, QueueState, DEFAULT_READER_ID};
pub use shard::{HandoverNamespaceInfo, ShardId, ShardInfo};
pub use task::{
    CategoryKind, HistoryTask, TaskCategory, TaskKey, TaskRange, TaskType,
};
pub use workflow::{HistoryEvent, WorkflowKey, WorkflowSnapshot, WorkflowState};
