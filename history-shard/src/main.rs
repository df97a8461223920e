use std::error::Error;
use std::sync::Arc;

use envconfig::Envconfig;
use history_shard::telemetry::{LogConfig, init_tracing};
use history_shard::{ShardConfig, ShardController, StaticClusterMetadata};
use shard_store::memory::MemoryShardStore;
use tokio::signal;
use tracing::{debug, error, info};

fn main() {
    let cpus = num_cpus::get();
    let worker_threads = std::cmp::max(1, cpus);

    println!(
        "Starting tokio runtime with {} worker threads",
        worker_threads
    );
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Unable to start tokio runtime: {}", err);
            std::process::exit(1);
        }
    };
    runtime.block_on(async {
        let logging = match LogConfig::init_from_env() {
            Ok(conf) => init_tracing(&conf),
            Err(err) => Err(err.into()),
        };
        if let Err(err) = logging {
            eprintln!("Failed to setup tracing: {}", err);
        }
        info!(
            "Tokio runtime started with {} worker threads",
            worker_threads
        );
        if let Err(err) = start().await {
            error!("history shard host failed: {}", err);
            std::process::exit(1);
        }
    });
}

async fn start() -> Result<(), Box<dyn Error>> {
    let conf = ShardConfig::init_from_env()?;
    debug!("use shard config: {:?}", conf);

    let store = Arc::new(MemoryShardStore::new());
    let metadata = Arc::new(StaticClusterMetadata::new(
        conf.cluster_name.clone(),
        conf.cluster_id,
    ));
    let num_shards = conf.num_shards;
    let controller = ShardController::new(conf, store, metadata);
    info!("shard host {} starting", controller.owner());

    for shard_id in 1..=num_shards {
        if let Err(err) = controller.get_or_create_shard(shard_id).await {
            error!("shard {}: not loaded: {}", shard_id, err);
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => {}
        Err(err) => {
            eprintln!("Unable to listen for shutdown signal: {}", err);
            // we also shut down in case of error
        }
    }
    info!("starting a clean up for shutdown");
    controller.close().await;
    info!("done clean up");
    Ok(())
}
