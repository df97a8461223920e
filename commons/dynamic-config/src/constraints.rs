use serde::{Deserialize, Serialize};

/// Filter attached to a configured value. Unset fields match only lookups
/// that also leave them unset; the all-empty value is the global default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Constraints {
    pub namespace: Option<String>,
    pub namespace_id: Option<String>,
    pub task_queue_name: Option<String>,
    pub task_queue_type: Option<i32>,
    pub shard_id: Option<i32>,
    pub task_type: Option<String>,
}

impl Constraints {
    pub fn global() -> Self {
        Self::default()
    }

    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    pub fn shard_id(shard_id: i32) -> Self {
        Self {
            shard_id: Some(shard_id),
            ..Default::default()
        }
    }
}

pub fn precedence_global() -> Vec<Constraints> {
    vec![Constraints::global()]
}

pub fn precedence_namespace(namespace: &str) -> Vec<Constraints> {
    vec![Constraints::namespace(namespace), Constraints::global()]
}

pub fn precedence_namespace_id(namespace_id: &str) -> Vec<Constraints> {
    vec![
        Constraints {
            namespace_id: Some(namespace_id.to_string()),
            ..Default::default()
        },
        Constraints::global(),
    ]
}

/// Most specific first: namespace+queue+type, namespace+queue, queue,
/// namespace, global.
pub fn precedence_task_queue(
    namespace: &str,
    task_queue: &str,
    task_queue_type: i32,
) -> Vec<Constraints> {
    vec![
        Constraints {
            namespace: Some(namespace.to_string()),
            task_queue_name: Some(task_queue.to_string()),
            task_queue_type: Some(task_queue_type),
            ..Default::default()
        },
        Constraints {
            namespace: Some(namespace.to_string()),
            task_queue_name: Some(task_queue.to_string()),
            ..Default::default()
        },
        Constraints {
            task_queue_name: Some(task_queue.to_string()),
            ..Default::default()
        },
        Constraints::namespace(namespace),
        Constraints::global(),
    ]
}

pub fn precedence_shard_id(shard_id: i32) -> Vec<Constraints> {
    vec![Constraints::shard_id(shard_id), Constraints::global()]
}

pub fn precedence_task_type(task_type: &str) -> Vec<Constraints> {
    vec![
        Constraints {
            task_type: Some(task_type.to_string()),
            ..Default::default()
        },
        Constraints::global(),
    ]
}
