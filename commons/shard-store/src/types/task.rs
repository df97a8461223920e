use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::workflow::WorkflowKey;

/// How tasks of a category are ordered for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CategoryKind {
    /// Ordered by task ID only; the fire time is always the Unix epoch.
    Immediate,
    /// Ordered by fire time first, task ID second.
    Scheduled,
}

/// A history task queue. Categories are identified on disk by their ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskCategory {
    id: i32,
    name: &'static str,
    kind: CategoryKind,
}

impl TaskCategory {
    pub const TRANSFER: TaskCategory =
        TaskCategory::new(1, "transfer", CategoryKind::Immediate);
    pub const TIMER: TaskCategory =
        TaskCategory::new(2, "timer", CategoryKind::Scheduled);
    pub const REPLICATION: TaskCategory =
        TaskCategory::new(3, "replication", CategoryKind::Immediate);
    pub const VISIBILITY: TaskCategory =
        TaskCategory::new(4, "visibility", CategoryKind::Immediate);
    pub const ARCHIVAL: TaskCategory =
        TaskCategory::new(5, "archival", CategoryKind::Scheduled);

    pub const ALL: [TaskCategory; 5] = [
        Self::TRANSFER,
        Self::TIMER,
        Self::REPLICATION,
        Self::VISIBILITY,
        Self::ARCHIVAL,
    ];

    pub const fn new(id: i32, name: &'static str, kind: CategoryKind) -> Self {
        Self { id, name, kind }
    }

    #[inline]
    pub fn id(&self) -> i32 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn kind(&self) -> CategoryKind {
        self.kind
    }

    pub fn from_id(id: i32) -> Option<TaskCategory> {
        Self::ALL.iter().copied().find(|c| c.id == id)
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// Position of a task inside its category queue.
///
/// Field order matters: the derived ordering compares the fire time first
/// and the task ID second.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
)]
pub struct TaskKey {
    pub fire_time: DateTime<Utc>,
    pub task_id: i64,
}

impl TaskKey {
    pub fn new(fire_time: DateTime<Utc>, task_id: i64) -> Self {
        Self { fire_time, task_id }
    }

    pub fn immediate(task_id: i64) -> Self {
        Self {
            fire_time: DateTime::<Utc>::UNIX_EPOCH,
            task_id,
        }
    }

    pub fn minimum() -> Self {
        Self {
            fire_time: DateTime::<Utc>::MIN_UTC,
            task_id: 0,
        }
    }

    /// The smallest key strictly greater than this one.
    pub fn next(&self) -> Self {
        Self {
            fire_time: self.fire_time,
            task_id: self.task_id.saturating_add(1),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.fire_time.to_rfc3339(), self.task_id)
    }
}

/// Half-open key range `[inclusive_min, exclusive_max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRange {
    pub inclusive_min: TaskKey,
    pub exclusive_max: TaskKey,
}

impl TaskRange {
    pub fn new(inclusive_min: TaskKey, exclusive_max: TaskKey) -> Self {
        Self {
            inclusive_min,
            exclusive_max,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inclusive_min >= self.exclusive_max
    }

    #[inline]
    pub fn contains(&self, key: &TaskKey) -> bool {
        *key >= self.inclusive_min && *key < self.exclusive_max
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    ActivityTask,
    WorkflowTask,
    CloseExecution,
    WorkflowTaskTimeout,
    ActivityTimeout,
    UserTimer,
    WorkflowRunTimeout,
    DeleteHistoryEvent,
    HistoryReplication,
    SyncActivity,
    UpsertExecutionVisibility,
    CloseExecutionVisibility,
    DeleteExecutionVisibility {
        close_visibility_task_id: i64,
        close_time: Option<DateTime<Utc>>,
    },
    ArchiveExecution,
}

impl TaskType {
    pub fn category(&self) -> TaskCategory {
        match self {
            TaskType::ActivityTask
            | TaskType::WorkflowTask
            | TaskType::CloseExecution => TaskCategory::TRANSFER,
            TaskType::WorkflowTaskTimeout
            | TaskType::ActivityTimeout
            | TaskType::UserTimer
            | TaskType::WorkflowRunTimeout
            | TaskType::DeleteHistoryEvent => TaskCategory::TIMER,
            TaskType::HistoryReplication | TaskType::SyncActivity => {
                TaskCategory::REPLICATION
            }
            TaskType::UpsertExecutionVisibility
            | TaskType::CloseExecutionVisibility
            | TaskType::DeleteExecutionVisibility { .. } => {
                TaskCategory::VISIBILITY
            }
            TaskType::ArchiveExecution => TaskCategory::ARCHIVAL,
        }
    }
}

/// A generated unit of work. The key's task ID is assigned by the shard
/// that persists the task; callers only choose the fire time of scheduled
/// tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTask {
    pub task_type: TaskType,
    pub workflow_key: WorkflowKey,
    pub key: TaskKey,
}

impl HistoryTask {
    pub fn new(task_type: TaskType, workflow_key: WorkflowKey) -> Self {
        Self {
            task_type,
            workflow_key,
            key: TaskKey::immediate(0),
        }
    }

    pub fn scheduled(
        task_type: TaskType,
        workflow_key: WorkflowKey,
        fire_time: DateTime<Utc>,
    ) -> Self {
        Self {
            task_type,
            workflow_key,
            key: TaskKey::new(fire_time, 0),
        }
    }

    #[inline]
    pub fn category(&self) -> TaskCategory {
        self.task_type.category()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn task_key_orders_by_fire_time_then_id() {
        let now = Utc::now();
        let a = TaskKey::new(now, 10);
        let b = TaskKey::new(now, 11);
        let c = TaskKey::new(now + Duration::milliseconds(1), 1);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.next(), b);
        assert!(TaskKey::minimum() < TaskKey::immediate(0));
    }

    #[test]
    fn category_lookup() {
        assert_eq!(TaskCategory::from_id(2), Some(TaskCategory::TIMER));
        assert_eq!(TaskCategory::from_id(42), None);
        assert_eq!(TaskCategory::TIMER.kind(), CategoryKind::Scheduled);
        let delete = TaskType::DeleteExecutionVisibility {
            close_visibility_task_id: 7,
            close_time: None,
        };
        assert_eq!(delete.category(), TaskCategory::VISIBILITY);
    }

    #[test]
    fn range_bounds_are_half_open() {
        let range =
            TaskRange::new(TaskKey::immediate(5), TaskKey::immediate(8));
        assert!(range.contains(&TaskKey::immediate(5)));
        assert!(range.contains(&TaskKey::immediate(7)));
        assert!(!range.contains(&TaskKey::immediate(8)));
        assert!(TaskRange::new(TaskKey::immediate(3), TaskKey::immediate(3))
            .is_empty());
    }
}
