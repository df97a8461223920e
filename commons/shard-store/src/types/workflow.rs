use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
pub struct WorkflowKey {
    pub namespace_id: String,
    pub workflow_id: String,
    pub run_id: String,
}

impl WorkflowKey {
    pub fn new(
        namespace_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

impl fmt::Display for WorkflowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace_id, self.workflow_id, self.run_id)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
pub enum WorkflowState {
    #[default]
    Created,
    Running,
    Completed,
    Zombie,
}

/// Persisted mutable state of one workflow run, as seen by this layer.
///
/// `db_record_version` is the version the write produces; the engine
/// accepts an overwrite only when the stored version is exactly one lower.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub key: WorkflowKey,
    pub state: WorkflowState,
    pub next_event_id: i64,
    pub last_write_version: i64,
    pub db_record_version: i64,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: i64,
    pub version: i64,
    pub event_time: DateTime<Utc>,
    pub event_type: String,
    pub attributes: Vec<u8>,
}
