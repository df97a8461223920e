use std::collections::HashMap;

use chrono::{DateTime, Utc};
use scc::hash_map::Entry::{Occupied, Vacant};
use shard_store::{HandoverNamespaceInfo, ShardId, ShardInfo};
use tracing::{debug, warn};

use crate::metadata::{Namespace, ReplicationState};

/// Reader ID under which a remote cluster's shard consumes this shard's
/// replication queue.
#[inline]
pub fn replication_reader_id(cluster_id: i64, shard_id: ShardId) -> i64 {
    (cluster_id << 32) | (shard_id as u32 as i64)
}

/// Inverse of [`replication_reader_id`].
#[inline]
pub fn reader_cluster_and_shard(reader_id: i64) -> (i64, ShardId) {
    (reader_id >> 32, (reader_id & 0xffff_ffff) as u32 as ShardId)
}

/// How far a remote cluster has consumed this shard's replication queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterReplicationStatus {
    pub acked_task_id: i64,
    pub acked_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoverNamespaceStatus {
    pub handover_replication_task_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplicationStatus {
    pub clusters: HashMap<String, ClusterReplicationStatus>,
    pub handover_namespaces: HashMap<String, HandoverNamespaceStatus>,
}

#[derive(Debug, Clone, Copy)]
struct AckPoint {
    task_id: i64,
    time: DateTime<Utc>,
}

impl AckPoint {
    /// Applies an ack unless it is older than this one. A repeat of the
    /// recorded task ID only advances the time.
    fn merge(&mut self, task_id: i64, time: DateTime<Utc>) -> bool {
        if task_id < self.task_id
            || (task_id == self.task_id && time <= self.time)
        {
            return false;
        }
        self.task_id = task_id;
        self.time = self.time.max(time);
        true
    }
}

#[derive(Debug, Clone, Default)]
struct RemoteClusterState {
    /// Acks keyed by the remote shard that consumed this shard's queue.
    acks: HashMap<ShardId, AckPoint>,
    current_time: Option<DateTime<Utc>>,
}

impl RemoteClusterState {
    fn merge_ack(
        &mut self,
        remote_shard: ShardId,
        task_id: i64,
        time: DateTime<Utc>,
    ) -> bool {
        match self.acks.get_mut(&remote_shard) {
            Some(point) => point.merge(task_id, time),
            None => {
                self.acks.insert(remote_shard, AckPoint { task_id, time });
                true
            }
        }
    }

    /// The slowest remote shard bounds what the cluster has seen.
    fn status(&self) -> Option<ClusterReplicationStatus> {
        self.acks
            .values()
            .min_by_key(|p| (p.task_id, p.time))
            .map(|p| ClusterReplicationStatus {
                acked_task_id: p.task_id,
                acked_time: Some(p.time),
            })
    }
}

/// Replication progress of one shard towards its remote clusters.
pub(crate) struct ReplicationTracker {
    remote_clusters: scc::HashMap<String, RemoteClusterState>,
    dlq_ack_levels: scc::HashMap<String, i64>,
    handover: scc::HashMap<String, HandoverNamespaceInfo>,
}

impl ReplicationTracker {
    pub fn new() -> Self {
        Self {
            remote_clusters: scc::HashMap::default(),
            dlq_ack_levels: scc::HashMap::default(),
            handover: scc::HashMap::default(),
        }
    }

    pub fn load(&self, info: &ShardInfo) {
        for (cluster, level) in info.replication_dlq_ack_level.iter() {
            self.dlq_ack_levels.upsert_sync(cluster.clone(), *level);
        }
        for (name, handover) in info.handover_namespaces.iter() {
            self.handover.upsert_sync(name.clone(), handover.clone());
        }
    }

    pub fn fill(&self, info: &mut ShardInfo) {
        info.replication_dlq_ack_level.clear();
        self.dlq_ack_levels.iter_sync(|cluster, level| {
            info.replication_dlq_ack_level.insert(cluster.clone(), *level);
            true
        });
        info.handover_namespaces.clear();
        self.handover.iter_sync(|name, handover| {
            info.handover_namespaces.insert(name.clone(), handover.clone());
            true
        });
    }

    /// `-1` when nothing was acknowledged yet.
    pub fn dlq_ack_level(&self, cluster: &str) -> i64 {
        self.dlq_ack_levels
            .read_sync(cluster, |_, level| *level)
            .unwrap_or(-1)
    }

    /// Raises the DLQ ack level; returns false when `level` is not above
    /// the recorded one.
    pub fn update_dlq_ack_level(&self, cluster: &str, level: i64) -> bool {
        match self.dlq_ack_levels.entry_sync(cluster.to_string()) {
            Occupied(mut occupied) => {
                if level <= *occupied.get() {
                    return false;
                }
                *occupied.get_mut() = level;
            }
            Vacant(vacant) => {
                vacant.insert_entry(level);
            }
        }
        true
    }

    pub fn update_remote_ack(
        &self,
        cluster: &str,
        remote_shard: ShardId,
        ack_task_id: i64,
        ack_time: DateTime<Utc>,
    ) -> bool {
        let mut entry = self
            .remote_clusters
            .entry_sync(cluster.to_string())
            .or_default();
        let applied =
            entry.get_mut().merge_ack(remote_shard, ack_task_id, ack_time);
        if !applied {
            debug!(
                "ignoring stale ack {} from cluster {}",
                ack_task_id, cluster
            );
        }
        applied
    }

    /// Moves a remote cluster's clock forward; earlier times are ignored.
    pub fn set_remote_time(&self, cluster: &str, time: DateTime<Utc>) -> bool {
        let mut entry = self
            .remote_clusters
            .entry_sync(cluster.to_string())
            .or_default();
        let state = entry.get_mut();
        match state.current_time {
            Some(current) if current > time => {
                warn!(
                    "cluster {} time moved backwards: {} < {}",
                    cluster, time, current
                );
                false
            }
            _ => {
                state.current_time = Some(time);
                true
            }
        }
    }

    pub fn remote_time(&self, cluster: &str) -> Option<DateTime<Utc>> {
        self.remote_clusters
            .read_sync(cluster, |_, state| state.current_time)
            .flatten()
    }

    /// Ack status of the clusters accepted by `filter`.
    pub fn status<F>(&self, filter: F) -> ReplicationStatus
    where
        F: Fn(&str) -> bool,
    {
        let mut status = ReplicationStatus::default();
        self.remote_clusters.iter_sync(|cluster, state| {
            if filter(cluster) {
                if let Some(s) = state.status() {
                    status.clusters.insert(cluster.clone(), s);
                }
            }
            true
        });
        self.handover.iter_sync(|name, handover| {
            status.handover_namespaces.insert(
                name.clone(),
                HandoverNamespaceStatus {
                    handover_replication_task_id: handover
                        .max_replication_task_id,
                },
            );
            true
        });
        status
    }

    /// Tracks a namespace entering or leaving handover. Notifications older
    /// than the recorded one are ignored. Returns whether anything changed.
    pub fn update_handover(
        &self,
        namespace: &Namespace,
        deleted_from_storage: bool,
        max_replication_task_id: i64,
    ) -> bool {
        if deleted_from_storage {
            return self.handover.remove_sync(&namespace.name).is_some();
        }
        if !namespace.is_global {
            return false;
        }

        match self.handover.entry_sync(namespace.name.clone()) {
            Occupied(mut occupied) => {
                if occupied.get().notification_version
                    >= namespace.notification_version
                {
                    return false;
                }
                if namespace.replication_state == ReplicationState::Handover {
                    let info = occupied.get_mut();
                    info.notification_version = namespace.notification_version;
                    info.max_replication_task_id = max_replication_task_id;
                } else {
                    let _ = occupied.remove();
                }
                true
            }
            Vacant(vacant) => {
                if namespace.replication_state != ReplicationState::Handover {
                    return false;
                }
                vacant.insert_entry(HandoverNamespaceInfo {
                    namespace_id: namespace.id.clone(),
                    notification_version: namespace.notification_version,
                    max_replication_task_id,
                });
                true
            }
        }
    }
}
