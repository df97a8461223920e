use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use history_shard::{
    ContextState, Namespace, QueueStateStore, ReplicationProgress,
    ReplicationState, ShardConfig, ShardController, ShardError, TaskIdSource,
    VectorClockSource,
};
use shard_store::{QueueState, TaskCategory, TaskKey};
use tracing_test::traced_test;

mod common;
use common::{
    is_ownership_lost, CountingEngineFactory, TestEnvironment, CLUSTER_A,
    CLUSTER_B,
};

fn transfer_state(task_id: i64) -> QueueState {
    QueueState::new(TaskKey::immediate(task_id))
}

async fn wait_for<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn engine_is_created_once_and_stopped_with_the_shard() {
    let env = TestEnvironment::new();
    let factory = Arc::new(CountingEngineFactory::default());
    let shard = history_shard::ShardContext::new(
        env.options(1, "host-a").with_engine_factory(factory.clone()),
    );
    assert!(matches!(
        shard.get_engine().await,
        Err(ShardError::Transient(_))
    ));
    shard.acquire().await.unwrap();

    shard.get_engine().await.unwrap();
    shard.get_engine().await.unwrap();
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    assert_eq!(factory.engine.started.load(Ordering::SeqCst), 1);

    shard.finish_stop();
    shard.finish_stop();
    assert_eq!(shard.state(), ContextState::Stopped);
    assert_eq!(factory.engine.stopped.load(Ordering::SeqCst), 1);
    assert!(is_ownership_lost(&shard.get_engine().await));
}

#[tokio::test]
async fn engine_requires_a_factory() {
    let env = TestEnvironment::new();
    let shard = env.acquire(1, "host-a").await;
    assert!(matches!(
        shard.get_engine().await,
        Err(ShardError::InvalidArgument(_))
    ));
}

#[tokio::test]
#[traced_test]
async fn invalidated_shard_stops_its_engine_and_can_be_stopped() {
    let env = TestEnvironment::new();
    let factory = Arc::new(CountingEngineFactory::default());
    let shard = history_shard::ShardContext::new(
        env.options(1, "host-a").with_engine_factory(factory.clone()),
    );
    shard.acquire().await.unwrap();
    shard.get_engine().await.unwrap();

    let _next = env.acquire(1, "host-b").await;
    assert!(is_ownership_lost(&shard.generate_task_id().await));
    assert_eq!(shard.state(), ContextState::Invalid);
    assert_eq!(factory.engine.stopped.load(Ordering::SeqCst), 1);

    shard.finish_stop();
    assert_eq!(shard.state(), ContextState::Stopped);
    assert_eq!(factory.engine.stopped.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unload_for_ownership_lost_stops_serving() {
    let env = TestEnvironment::new();
    let shard = env.acquire(1, "host-a").await;
    shard.unload_for_ownership_lost();
    assert_eq!(shard.state(), ContextState::Stopped);
    assert!(!shard.is_valid());
    assert!(is_ownership_lost(&shard.generate_task_id().await));
    assert!(is_ownership_lost(&shard.acquire().await));
}

#[tokio::test]
async fn timed_out_write_is_verified_before_the_next_one() {
    let env = TestEnvironment::new();
    let shard = env.acquire(1, "host-a").await;

    env.store.inject_write_timeouts(1, false);
    let err = shard
        .set_queue_state(TaskCategory::TRANSFER, 0, transfer_state(1000))
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "got {:?}", err);
    assert_eq!(shard.state(), ContextState::Active);

    // The stored range is still ours, so the next write goes through.
    shard
        .set_queue_state(TaskCategory::TRANSFER, 0, transfer_state(1001))
        .await
        .unwrap();
    shard.assert_ownership().await.unwrap();
    assert_eq!(env.stored_range(1).await, 1);
}

#[tokio::test]
async fn every_call_fails_fast_once_ownership_is_lost() {
    let env = TestEnvironment::new();
    let shard = env.acquire(7, "host-a").await;
    shard
        .set_queue_state(TaskCategory::TRANSFER, 0, transfer_state(1000))
        .await
        .unwrap();

    let _next = env.acquire(7, "host-b").await;
    assert!(is_ownership_lost(&shard.assert_ownership().await));
    assert_eq!(shard.state(), ContextState::Invalid);

    assert!(is_ownership_lost(
        &shard.get_queue_state(TaskCategory::TRANSFER)
    ));
    assert!(is_ownership_lost(
        &shard.get_queue_exclusive_high_read_watermark(TaskCategory::TRANSFER)
    ));
    assert!(is_ownership_lost(&shard.current_vector_clock()));
    assert!(is_ownership_lost(&shard.new_vector_clock().await));
    assert!(is_ownership_lost(
        &shard.get_replicator_dlq_ack_level(CLUSTER_B)
    ));
    assert!(is_ownership_lost(&shard.get_current_time(CLUSTER_A)));
    assert!(is_ownership_lost(&shard.get_current_time(CLUSTER_B)));
    assert!(is_ownership_lost(&shard.get_replication_status(&[])));

    let handover = Namespace::new("ns-orders", "orders")
        .global(CLUSTER_A)
        .with_replication_state(ReplicationState::Handover, 1);
    assert!(is_ownership_lost(
        &shard.update_handover_namespace(&handover, false)
    ));
}

#[tokio::test]
async fn range_taken_after_a_timed_out_write_is_noticed_without_a_feed() {
    let env = TestEnvironment::without_range_feed();
    let shard = env.acquire(1, "host-a").await;

    env.store.inject_write_timeouts(1, false);
    let err = shard
        .set_queue_state(TaskCategory::TRANSFER, 0, transfer_state(1000))
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "got {:?}", err);

    let next = env.acquire(1, "host-b").await;
    assert_eq!(shard.state(), ContextState::Active);

    // No feed and no write: only the re-read can see the new owner.
    assert!(is_ownership_lost(&shard.generate_task_id().await));
    assert_eq!(shard.state(), ContextState::Invalid);
    assert!(is_ownership_lost(
        &shard
            .set_queue_state(TaskCategory::TRANSFER, 0, transfer_state(1001))
            .await
    ));
    assert_eq!(next.generate_task_id().await.unwrap(), 2000);
    assert_eq!(env.stored_range(1).await, 2);
}

#[tokio::test]
async fn dropped_write_is_verified_before_more_ids_are_issued() {
    let env = TestEnvironment::without_range_feed();
    let shard = env.acquire(1, "host-a").await;

    env.store.delay_next_write(Duration::from_secs(30));
    let pending = {
        let shard = shard.clone();
        tokio::spawn(async move {
            let state = transfer_state(1000);
            shard.set_queue_state(TaskCategory::TRANSFER, 0, state).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    pending.abort();
    assert!(pending.await.unwrap_err().is_cancelled());
    assert_eq!(shard.state(), ContextState::Active);

    let _next = env.acquire(1, "host-b").await;
    assert!(is_ownership_lost(&shard.generate_task_id().await));
    assert_eq!(shard.state(), ContextState::Invalid);
    assert_eq!(env.stored_range(1).await, 2);
}

#[tokio::test]
async fn failed_renewal_invalidates_the_shard() {
    let env = TestEnvironment::with_range_size(2);
    let shard = env.acquire(1, "host-a").await;
    assert_eq!(shard.generate_task_ids(2).await.unwrap(), vec![2, 3]);

    // The renewal lands but reports a timeout.
    env.store.inject_write_timeouts(1, true);
    let err = shard.generate_task_id().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(shard.state(), ContextState::Invalid);
    assert_eq!(env.stored_range(1).await, 2);
    assert!(is_ownership_lost(&shard.generate_task_id().await));

    let next = env.acquire(1, "host-b").await;
    assert_eq!(next.generate_task_id().await.unwrap(), 6);
}

fn controller_config(owner: &str) -> ShardConfig {
    ShardConfig {
        owner: Some(owner.to_string()),
        range_size: 100,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn controller_reuses_and_evicts_shards() {
    let env = TestEnvironment::new();
    let controller = ShardController::new(
        controller_config("host-a"),
        env.store.clone(),
        env.metadata.clone(),
    );
    assert_eq!(controller.owner(), "host-a");

    let first = controller.get_or_create_shard(3).await.unwrap();
    let again = controller.get_or_create_shard(3).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(first.generate_task_id().await.unwrap(), 100);
    assert_eq!(controller.shard_count(), 1);

    // Another host takes the shard; the next call notices.
    let _other = env.acquire(3, "host-b").await;
    assert!(is_ownership_lost(&first.generate_task_id().await));
    wait_for(|| controller.get_shard(3).is_none()).await;
    assert_eq!(first.state(), ContextState::Stopped);

    let reloaded = controller.get_or_create_shard(3).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &reloaded));
    assert_eq!(reloaded.range_id(), 3);

    let mut stats = controller.stats().await;
    for _ in 0..100 {
        if stats.total_shards_evicted == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        stats = controller.stats().await;
    }
    assert_eq!(stats.total_shards_acquired, 2);
    assert_eq!(stats.total_shards_evicted, 1);
    assert_eq!(stats.active_shards, 1);

    controller.close().await;
    assert_eq!(controller.shard_count(), 0);
    assert_eq!(reloaded.state(), ContextState::Stopped);
}

#[tokio::test]
async fn controller_counts_failed_acquisitions() {
    let env = TestEnvironment::new();
    let controller = ShardController::new(
        ShardConfig {
            range_size: 0,
            ..controller_config("host-a")
        },
        env.store.clone(),
        env.metadata.clone(),
    );
    let err = controller.get_or_create_shard(1).await.err().unwrap();
    assert!(matches!(err, ShardError::InvalidArgument(_)));
    assert_eq!(controller.shard_count(), 0);
    assert_eq!(controller.stats().await.failed_acquisitions, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn controller_shares_one_engine_factory() {
    let env = TestEnvironment::new();
    let factory = Arc::new(CountingEngineFactory::default());
    let controller = ShardController::new(
        controller_config("host-a"),
        env.store.clone(),
        env.metadata.clone(),
    )
    .with_engine_factory(factory.clone());

    let one = controller.get_or_create_shard(1).await.unwrap();
    let two = controller.get_or_create_shard(2).await.unwrap();
    one.get_engine().await.unwrap();
    two.get_engine().await.unwrap();
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    assert_eq!(
        one.get_queue_exclusive_high_read_watermark(TaskCategory::TRANSFER)
            .unwrap(),
        TaskKey::immediate(100)
    );

    controller.close().await;
    assert_eq!(factory.engine.stopped.load(Ordering::SeqCst), 2);
}
