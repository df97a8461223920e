use std::hash::BuildHasherDefault;
use std::sync::Arc;

use dynamic_config::Collection;
use nohash_hasher::NoHashHasher;
use scc::hash_map::Entry::{Occupied, Vacant};
use scc::HashMap;
use shard_store::{ShardId, ShardPersistence};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::ShardError;
use crate::metadata::ClusterMetadata;
use crate::ShardConfig;

use super::config::ShardSettings;
use super::context::{ShardContext, ShardContextOptions};
use super::state::ContextState;
use super::traits::EngineFactory;

type ShardMap =
    HashMap<ShardId, Arc<ShardContext>, BuildHasherDefault<NoHashHasher<i32>>>;

#[derive(Debug, Default, Clone)]
pub struct ControllerStats {
    pub total_shards_acquired: u32,
    pub total_shards_evicted: u32,
    pub active_shards: u32,
    pub failed_acquisitions: u32,
}

/// Owns the shard contexts of this process and evicts each one as soon as
/// it stops being valid.
pub struct ShardController {
    owner: String,
    config: ShardConfig,
    dynamic_config: Option<Arc<Collection>>,
    store: Arc<dyn ShardPersistence>,
    cluster_metadata: Arc<dyn ClusterMetadata>,
    engine_factory: Option<Arc<dyn EngineFactory>>,
    shards: Arc<ShardMap>,
    /// Serializes acquisitions so one shard is never acquired twice at once.
    acquire_lock: Mutex<()>,
    stats: Arc<RwLock<ControllerStats>>,
}

impl ShardController {
    pub fn new(
        config: ShardConfig,
        store: Arc<dyn ShardPersistence>,
        cluster_metadata: Arc<dyn ClusterMetadata>,
    ) -> Self {
        Self {
            owner: config.get_owner(),
            config,
            dynamic_config: None,
            store,
            cluster_metadata,
            engine_factory: None,
            shards: Arc::new(HashMap::default()),
            acquire_lock: Mutex::new(()),
            stats: Arc::new(RwLock::new(ControllerStats::default())),
        }
    }

    pub fn with_dynamic_config(mut self, collection: Arc<Collection>) -> Self {
        self.dynamic_config = Some(collection);
        self
    }

    pub fn with_engine_factory(
        mut self,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        self.engine_factory = Some(factory);
        self
    }

    #[inline]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[inline]
    pub fn get_shard(&self, shard_id: ShardId) -> Option<Arc<ShardContext>> {
        self.shards.read_sync(&shard_id, |_, shard| Arc::clone(shard))
    }

    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn get_valid_shard(&self, shard_id: ShardId) -> Option<Arc<ShardContext>> {
        self.get_shard(shard_id).filter(|shard| shard.is_valid())
    }

    pub async fn stats(&self) -> ControllerStats {
        self.stats.read().await.clone()
    }

    /// Returns the valid context of `shard_id`, acquiring the shard when
    /// none is loaded.
    pub async fn get_or_create_shard(
        &self,
        shard_id: ShardId,
    ) -> Result<Arc<ShardContext>, ShardError> {
        if let Some(shard) = self.get_valid_shard(shard_id) {
            return Ok(shard);
        }
        let _acquiring = self.acquire_lock.lock().await;
        if let Some(shard) = self.get_valid_shard(shard_id) {
            return Ok(shard);
        }

        let settings = ShardSettings::resolve(
            &self.config,
            self.dynamic_config.as_deref(),
            shard_id,
        );
        debug!("shard {}: acquiring with {:?}", shard_id, settings);
        let mut options = ShardContextOptions::new(
            shard_id,
            self.owner.clone(),
            self.store.clone(),
            self.cluster_metadata.clone(),
        )
        .with_settings(settings);
        if let Some(factory) = &self.engine_factory {
            options = options.with_engine_factory(factory.clone());
        }
        let shard = ShardContext::new(options);

        if let Err(err) = shard.acquire().await {
            error!("shard {}: acquisition failed: {}", shard_id, err);
            let mut stats = self.stats.write().await;
            stats.failed_acquisitions += 1;
            return Err(err);
        }

        match self.shards.entry_sync(shard_id) {
            Occupied(mut occupied) => {
                let previous =
                    std::mem::replace(occupied.get_mut(), shard.clone());
                previous.finish_stop();
            }
            Vacant(vacant) => {
                vacant.insert_entry(shard.clone());
            }
        }
        self.watch_shard(shard.clone());

        let mut stats = self.stats.write().await;
        stats.total_shards_acquired += 1;
        stats.active_shards = self.shards.len() as u32;
        info!("shard {}: loaded at range {}", shard_id, shard.range_id());
        Ok(shard)
    }

    /// Evicts `shard` once it turns invalid or stopped.
    fn watch_shard(&self, shard: Arc<ShardContext>) {
        let shards = Arc::clone(&self.shards);
        let stats = Arc::clone(&self.stats);
        let mut state = shard.watch_state();
        tokio::spawn(async move {
            loop {
                let current = *state.borrow_and_update();
                if current.is_terminal() {
                    break;
                }
                if state.changed().await.is_err() {
                    break;
                }
            }
            if shard.state() == ContextState::Invalid {
                warn!("shard {}: ownership lost, unloading", shard.shard_id());
                shard.finish_stop();
            }
            let evicted = match shards.entry_sync(shard.shard_id()) {
                Occupied(occupied) if Arc::ptr_eq(occupied.get(), &shard) => {
                    let _ = occupied.remove();
                    true
                }
                _ => false,
            };
            if evicted {
                info!("shard {}: evicted", shard.shard_id());
                let mut stats = stats.write().await;
                stats.total_shards_evicted += 1;
                stats.active_shards = shards.len() as u32;
            }
        });
    }

    /// Stops every loaded shard.
    pub async fn close(&self) {
        let mut loaded = Vec::new();
        self.shards.iter_sync(|_, shard| {
            loaded.push(Arc::clone(shard));
            true
        });
        for shard in loaded {
            shard.finish_stop();
            self.shards.remove_sync(&shard.shard_id());
        }
        let mut stats = self.stats.write().await;
        stats.active_shards = 0;
        info!("shard controller {} closed", self.owner);
    }
}
