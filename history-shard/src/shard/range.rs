use std::sync::Arc;

use shard_store::{
    ShardId, ShardInfo, ShardPersistence, StoreResult, UpdateShardRequest,
};
use tracing::{debug, info};

/// Conditional writer of the shard record.
///
/// Every write names the range ID it expects to find in storage, so a
/// process that lost the lease can never overwrite its successor.
pub(crate) struct RangeAllocator {
    store: Arc<dyn ShardPersistence>,
    shard_id: ShardId,
    owner: String,
}

impl RangeAllocator {
    pub fn new(
        store: Arc<dyn ShardPersistence>,
        shard_id: ShardId,
        owner: String,
    ) -> Self {
        Self {
            store,
            shard_id,
            owner,
        }
    }

    /// Takes the lease: reads (or creates) the record and persists it with
    /// the range ID bumped by one. Taking a shard from another owner counts
    /// as a steal.
    pub async fn acquire(&self) -> StoreResult<ShardInfo> {
        let mut info = self
            .store
            .get_or_create_shard(self.shard_id, &self.owner)
            .await?;
        let previous = info.range_id;
        if info.owner != self.owner {
            info!(
                "shard {}: taking over from {} at range {}",
                self.shard_id, info.owner, previous
            );
            info.owner = self.owner.clone();
            info.stolen_since_renew += 1;
        }
        info.range_id = previous + 1;
        self.store
            .update_shard(UpdateShardRequest {
                shard_info: info.clone(),
                previous_range_id: previous,
            })
            .await?;
        Ok(info)
    }

    /// Extends the lease with the next range. `snapshot` carries the
    /// in-memory progress and the range ID being renewed.
    pub async fn renew(&self, snapshot: ShardInfo) -> StoreResult<ShardInfo> {
        let previous = snapshot.range_id;
        let mut info = snapshot;
        info.range_id = previous + 1;
        info.stolen_since_renew = 0;
        self.store
            .update_shard(UpdateShardRequest {
                shard_info: info.clone(),
                previous_range_id: previous,
            })
            .await?;
        debug!(
            "shard {}: renewed range {} -> {}",
            self.shard_id, previous, info.range_id
        );
        Ok(info)
    }

    /// Writes `snapshot` without moving the range.
    pub async fn persist(&self, snapshot: ShardInfo) -> StoreResult<()> {
        let range_id = snapshot.range_id;
        self.store
            .update_shard(UpdateShardRequest {
                shard_info: snapshot,
                previous_range_id: range_id,
            })
            .await
    }

    /// The record as currently stored.
    pub async fn read(&self) -> StoreResult<ShardInfo> {
        self.store.get_shard(self.shard_id).await
    }
}
