use std::cmp::Ordering;
use std::collections::HashSet;

use history_shard::{
    ContextState, ShardError, TaskIdSource, VectorClockSource,
};
use tracing_test::traced_test;

mod common;
use common::{is_ownership_lost, TestEnvironment};

#[tokio::test]
#[traced_test]
async fn new_owner_fences_the_previous_one() {
    let env = TestEnvironment::with_range_size(1000);
    env.seed_range(7, 3).await;

    let shard = env.acquire(7, "host-a").await;
    assert_eq!(shard.range_id(), 4);
    assert_eq!(env.stored_range(7).await, 4);
    assert_eq!(
        shard.generate_task_ids(3).await.unwrap(),
        vec![4000, 4001, 4002]
    );

    let competitor = env.acquire(7, "host-b").await;
    assert_eq!(competitor.range_id(), 5);

    let res = shard.generate_task_id().await;
    assert!(is_ownership_lost(&res), "got {:?}", res);
    assert_eq!(shard.state(), ContextState::Invalid);
    assert!(is_ownership_lost(&shard.assert_ownership().await));

    assert_eq!(competitor.generate_task_id().await.unwrap(), 5000);
    assert_eq!(env.stored_range(7).await, 5);
}

#[tokio::test]
async fn stolen_record_counts_the_takeover() {
    let env = TestEnvironment::new();
    let first = env.acquire(3, "host-a").await;
    first.assert_ownership().await.unwrap();
    let _second = env.acquire(3, "host-b").await;

    let info = shard_store::ShardStore::get_shard(env.store.as_ref(), 3)
        .await
        .unwrap();
    assert_eq!(info.owner, "host-b");
    assert_eq!(info.stolen_since_renew, 1);
}

#[tokio::test]
async fn ids_stay_monotonic_across_renewals() {
    let env = TestEnvironment::with_range_size(10);
    let shard = env.acquire(1, "host-a").await;

    let mut previous = -1;
    for _ in 0..25 {
        let id = shard.generate_task_id().await.unwrap();
        assert!(id > previous, "{} after {}", id, previous);
        previous = id;
    }
    assert_eq!(previous, 34);
    assert_eq!(shard.range_id(), 3);
    assert_eq!(env.stored_range(1).await, 3);
    assert_eq!(shard.state(), ContextState::Active);
}

#[tokio::test]
async fn batch_allocation_is_contiguous() {
    let env = TestEnvironment::with_range_size(10);
    let shard = env.acquire(1, "host-a").await;

    assert!(shard.generate_task_ids(0).await.unwrap().is_empty());
    assert_eq!(
        shard.generate_task_ids(6).await.unwrap(),
        (10..16).collect::<Vec<_>>()
    );
    // Four IDs remain in the block; seven more come from the next range.
    assert_eq!(
        shard.generate_task_ids(7).await.unwrap(),
        (20..27).collect::<Vec<_>>()
    );

    let err = shard.generate_task_ids(11).await.unwrap_err();
    assert!(matches!(err, ShardError::InvalidArgument(_)));
    assert_eq!(shard.state(), ContextState::Active);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_generators_never_share_an_id() {
    let env = TestEnvironment::with_range_size(16);
    let shard = env.acquire(2, "host-a").await;

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let shard = shard.clone();
            tokio::spawn(async move {
                let mut ids = Vec::with_capacity(50);
                for _ in 0..50 {
                    ids.push(shard.generate_task_id().await.unwrap());
                }
                ids
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for task in tasks {
        let ids = task.await.unwrap();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        for id in ids {
            assert!(seen.insert(id), "duplicate id {}", id);
        }
    }
    assert_eq!(seen.len(), 400);
}

#[tokio::test]
async fn calls_before_acquisition_are_transient() {
    let env = TestEnvironment::new();
    let shard = env.context(4, "host-a");
    assert_eq!(shard.state(), ContextState::Initializing);

    let err = shard.generate_task_id().await.unwrap_err();
    assert!(matches!(err, ShardError::Transient(_)));
    assert!(err.is_retryable());

    shard.acquire().await.unwrap();
    let again = shard.acquire().await.unwrap_err();
    assert!(matches!(again, ShardError::InvalidArgument(_)));
    assert_eq!(shard.state(), ContextState::Active);
}

#[tokio::test]
async fn non_positive_range_size_is_rejected() {
    let env = TestEnvironment::with_range_size(0);
    let shard = env.context(5, "host-a");
    let err = shard.acquire().await.unwrap_err();
    assert!(matches!(err, ShardError::InvalidArgument(_)));
    assert_eq!(shard.state(), ContextState::Invalid);
}

#[tokio::test]
async fn vector_clocks_order_across_owners() {
    let env = TestEnvironment::with_range_size(1000);
    env.seed_range(7, 3).await;
    let first = env.acquire(7, "host-a").await;
    let early = first.new_vector_clock().await.unwrap();
    assert_eq!(early.clock, 4000);
    assert_eq!(early.cluster_id, 1);
    assert_eq!(early.shard_id, 7);
    assert_eq!(first.current_vector_clock().unwrap().clock, 4000);

    let second = env.acquire(7, "host-b").await;
    let late = second.new_vector_clock().await.unwrap();
    assert_eq!(late.clock, 5000);
    assert_eq!(late.compare(&early).unwrap(), Ordering::Greater);
    assert_eq!(early.compare(&late).unwrap(), Ordering::Less);

    let other_shard = env.acquire(8, "host-b").await;
    let foreign = other_shard.new_vector_clock().await.unwrap();
    assert!(matches!(
        foreign.compare(&late),
        Err(ShardError::InvalidArgument(_))
    ));
}
