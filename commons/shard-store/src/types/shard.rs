use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::queue::QueueState;

pub type ShardId = i32;

/// Handover bookkeeping for a namespace migrating write authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverNamespaceInfo {
    pub namespace_id: String,
    pub notification_version: i64,
    /// Highest replication task ID that must be acknowledged by remote
    /// clusters before the handover can complete.
    pub max_replication_task_id: i64,
}

/// The durable shard record. Its `range_id` is the fencing token: a
/// conditional update succeeds only when the caller presents the range ID
/// currently stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub shard_id: ShardId,
    pub owner: String,
    pub range_id: i64,
    pub stolen_since_renew: i32,
    pub updated_at: DateTime<Utc>,
    pub queue_states: HashMap<i32, QueueState>,
    pub replication_dlq_ack_level: HashMap<String, i64>,
    pub handover_namespaces: HashMap<String, HandoverNamespaceInfo>,
}

impl ShardInfo {
    pub fn new(shard_id: ShardId, owner: impl Into<String>) -> Self {
        Self {
            shard_id,
            owner: owner.into(),
            range_id: 0,
            stolen_since_renew: 0,
            updated_at: Utc::now(),
            queue_states: HashMap::new(),
            replication_dlq_ack_level: HashMap::new(),
            handover_namespaces: HashMap::new(),
        }
    }
}
