use chrono::{DateTime, Duration, Utc};
use history_shard::shard::replication_reader_id;
use history_shard::{
    Namespace, ReplicationProgress, ReplicationState, ShardError, TaskIdSource,
};
use shard_store::ShardStore;

mod common;
use common::{is_ownership_lost, TestEnvironment, CLUSTER_A, CLUSTER_B};

#[tokio::test]
async fn remote_acks_are_reported_per_cluster() {
    let env = TestEnvironment::new();
    let shard = env.acquire(7, "host-a").await;
    let t1 = Utc::now();

    shard.update_remote_cluster_info(CLUSTER_B, 120, t1).unwrap();
    let status = shard.get_replication_status(&[]).unwrap();
    let b = status.clusters[CLUSTER_B];
    assert_eq!(b.acked_task_id, 120);
    assert_eq!(b.acked_time, Some(t1));

    // A late, lower ack does not move the cluster back.
    shard
        .update_remote_cluster_info(CLUSTER_B, 90, t1 + Duration::seconds(1))
        .unwrap();
    let status = shard
        .get_replication_status(&[CLUSTER_B.to_string()])
        .unwrap();
    assert_eq!(status.clusters[CLUSTER_B].acked_task_id, 120);

    let err = shard
        .update_remote_cluster_info("clusterZ", 5, t1)
        .unwrap_err();
    assert!(matches!(err, ShardError::InvalidArgument(_)));

    let filtered = shard
        .get_replication_status(&["clusterC".to_string()])
        .unwrap();
    assert!(filtered.clusters.is_empty());
}

#[tokio::test]
async fn reader_acks_are_bounded_by_the_slowest_remote_shard() {
    let env = TestEnvironment::new();
    let shard = env.acquire(7, "host-a").await;
    let now = Utc::now();

    shard
        .update_remote_reader_info(replication_reader_id(2, 3), 400, now)
        .unwrap();
    shard
        .update_remote_reader_info(replication_reader_id(2, 4), 250, now)
        .unwrap();
    let status = shard.get_replication_status(&[]).unwrap();
    assert_eq!(status.clusters[CLUSTER_B].acked_task_id, 250);

    let err = shard
        .update_remote_reader_info(replication_reader_id(9, 3), 10, now)
        .unwrap_err();
    assert!(matches!(err, ShardError::InvalidArgument(_)));
}

#[tokio::test]
async fn dlq_ack_level_is_durable() {
    let env = TestEnvironment::new();
    let shard = env.acquire(2, "host-a").await;
    assert_eq!(shard.get_replicator_dlq_ack_level(CLUSTER_B).unwrap(), -1);

    shard
        .update_replicator_dlq_ack_level(CLUSTER_B, 33)
        .await
        .unwrap();
    shard
        .update_replicator_dlq_ack_level(CLUSTER_B, 20)
        .await
        .unwrap();
    assert_eq!(shard.get_replicator_dlq_ack_level(CLUSTER_B).unwrap(), 33);

    let stored = env.store.get_shard(2).await.unwrap();
    assert_eq!(stored.replication_dlq_ack_level.get(CLUSTER_B), Some(&33));

    let next = env.acquire(2, "host-b").await;
    assert_eq!(next.get_replicator_dlq_ack_level(CLUSTER_B).unwrap(), 33);
    let res = shard.update_replicator_dlq_ack_level(CLUSTER_B, 40).await;
    assert!(is_ownership_lost(&res));
}

#[tokio::test]
async fn handover_records_the_replication_high_watermark() {
    let env = TestEnvironment::new();
    let shard = env.acquire(1, "host-a").await;
    shard.generate_task_ids(10).await.unwrap();

    let ns = Namespace::new("ns-orders", "orders").global(CLUSTER_A);
    let handover = ns
        .clone()
        .with_replication_state(ReplicationState::Handover, 4);
    shard.update_handover_namespace(&handover, false).unwrap();

    let status = shard.get_replication_status(&[]).unwrap();
    assert_eq!(
        status.handover_namespaces["orders"].handover_replication_task_id,
        1009
    );

    // Older notifications do not change anything.
    shard.generate_task_ids(5).await.unwrap();
    let stale = ns
        .clone()
        .with_replication_state(ReplicationState::Handover, 3);
    shard.update_handover_namespace(&stale, false).unwrap();
    let status = shard.get_replication_status(&[]).unwrap();
    assert_eq!(
        status.handover_namespaces["orders"].handover_replication_task_id,
        1009
    );

    let local = Namespace::new("ns-local", "local")
        .with_replication_state(ReplicationState::Handover, 9);
    shard.update_handover_namespace(&local, false).unwrap();
    assert!(!shard
        .get_replication_status(&[])
        .unwrap()
        .handover_namespaces
        .contains_key("local"));

    let done = ns.clone().with_replication_state(ReplicationState::Normal, 5);
    shard.update_handover_namespace(&done, false).unwrap();
    assert!(shard
        .get_replication_status(&[])
        .unwrap()
        .handover_namespaces
        .is_empty());

    let again = ns.with_replication_state(ReplicationState::Handover, 6);
    shard.update_handover_namespace(&again, false).unwrap();
    shard.update_handover_namespace(&again, true).unwrap();
    assert!(shard
        .get_replication_status(&[])
        .unwrap()
        .handover_namespaces
        .is_empty());
}

#[tokio::test]
async fn remote_cluster_time() {
    let env = TestEnvironment::new();
    let shard = env.acquire(1, "host-a").await;

    assert_eq!(
        shard.get_current_time(CLUSTER_B).unwrap(),
        DateTime::<Utc>::UNIX_EPOCH
    );
    let t = Utc::now() - Duration::minutes(2);
    shard.set_current_time(CLUSTER_B, t).unwrap();
    assert_eq!(shard.get_current_time(CLUSTER_B).unwrap(), t);

    // Going back is ignored.
    shard
        .set_current_time(CLUSTER_B, t - Duration::seconds(30))
        .unwrap();
    assert_eq!(shard.get_current_time(CLUSTER_B).unwrap(), t);

    let before = Utc::now();
    assert!(shard.get_current_time(CLUSTER_A).unwrap() >= before);
    assert!(matches!(
        shard.set_current_time(CLUSTER_A, t),
        Err(ShardError::InvalidArgument(_))
    ));
    assert!(matches!(
        shard.set_current_time("clusterZ", t),
        Err(ShardError::InvalidArgument(_))
    ));
}
