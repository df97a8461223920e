use std::collections::BTreeMap;

/// Static facts about the clusters this deployment replicates with.
pub trait ClusterMetadata: Send + Sync {
    fn current_cluster_name(&self) -> &str;

    fn cluster_id(&self, cluster_name: &str) -> Option<i64>;

    fn cluster_name(&self, cluster_id: i64) -> Option<String>;

    /// Every enabled cluster other than the current one.
    fn remote_cluster_names(&self) -> Vec<String>;

    fn current_cluster_id(&self) -> i64 {
        self.cluster_id(self.current_cluster_name()).unwrap_or_default()
    }

    fn is_known_cluster(&self, cluster_name: &str) -> bool {
        self.cluster_id(cluster_name).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub id: i64,
    pub enabled: bool,
}

/// [`ClusterMetadata`] over a fixed cluster table.
#[derive(Debug, Clone)]
pub struct StaticClusterMetadata {
    current: String,
    clusters: BTreeMap<String, ClusterInfo>,
}

impl StaticClusterMetadata {
    pub fn new(current_cluster: impl Into<String>, current_id: i64) -> Self {
        let current = current_cluster.into();
        let mut clusters = BTreeMap::new();
        clusters.insert(
            current.clone(),
            ClusterInfo {
                id: current_id,
                enabled: true,
            },
        );
        Self { current, clusters }
    }

    pub fn with_cluster(mut self, name: impl Into<String>, id: i64) -> Self {
        self.clusters.insert(name.into(), ClusterInfo { id, enabled: true });
        self
    }

    pub fn with_disabled_cluster(
        mut self,
        name: impl Into<String>,
        id: i64,
    ) -> Self {
        self.clusters.insert(name.into(), ClusterInfo { id, enabled: false });
        self
    }
}

impl ClusterMetadata for StaticClusterMetadata {
    fn current_cluster_name(&self) -> &str {
        &self.current
    }

    fn cluster_id(&self, cluster_name: &str) -> Option<i64> {
        self.clusters.get(cluster_name).map(|c| c.id)
    }

    fn cluster_name(&self, cluster_id: i64) -> Option<String> {
        self.clusters
            .iter()
            .find(|(_, info)| info.id == cluster_id)
            .map(|(name, _)| name.clone())
    }

    fn remote_cluster_names(&self) -> Vec<String> {
        self.clusters
            .iter()
            .filter(|(name, info)| info.enabled && **name != self.current)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationState {
    #[default]
    Normal,
    /// Write authority is moving to another cluster.
    Handover,
}

/// The slice of namespace registry data the shard layer consumes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Namespace {
    pub id: String,
    pub name: String,
    pub is_global: bool,
    pub active_cluster: String,
    pub replication_state: ReplicationState,
    pub notification_version: i64,
}

impl Namespace {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn global(mut self, active_cluster: impl Into<String>) -> Self {
        self.is_global = true;
        self.active_cluster = active_cluster.into();
        self
    }

    pub fn with_replication_state(
        mut self,
        state: ReplicationState,
        notification_version: i64,
    ) -> Self {
        self.replication_state = state;
        self.notification_version = notification_version;
        self
    }
}
