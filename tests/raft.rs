//! Replication across stores: repair, quorum loss, snapshot catch-up,
//! and the fatal storage fault policy.

mod common;

use common::TestCluster;
use meridian::api::data::{RangeId, StoreId};
use meridian::api::request::{InternalTruncateLogRequest, Request, RequestHeader};
use meridian::core::clock::Timestamp;
use meridian::core::config::ZoneConfig;
use meridian::ops::status::StatusMonitor;
use meridian::range::queues;
use meridian::storage::mvcc;
use std::time::Duration;

/// Drive the replicate queue until the first range reaches `replicas`
/// replicas with a live replica object on every store.
async fn replicate_first_range(cluster: &TestCluster, replicas: usize) {
    for _ in 0..100 {
        queues::replicate_scan(cluster.stores[0].clone()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let desc = cluster.stores[0]
            .replica(RangeId(1))
            .expect("first range")
            .descriptor();
        let materialized = desc
            .replicas
            .iter()
            .filter(|r| {
                cluster
                    .stores
                    .iter()
                    .find(|s| s.store_id() == r.store_id)
                    .map(|s| s.replica(RangeId(1)).is_some())
                    .unwrap_or(false)
            })
            .count();
        if desc.replicas.len() >= replicas && materialized >= replicas {
            return;
        }
    }
    panic!("first range never reached {replicas} replicas");
}

/// Read a key's bytes directly from a store's engine, bypassing routing.
fn engine_get(cluster: &TestCluster, store_index: usize, key: &[u8]) -> Option<Vec<u8>> {
    mvcc::get(
        cluster.stores[store_index].engine().as_reader(),
        key,
        Timestamp::max(),
        None,
    )
    .unwrap()
    .and_then(|v| v.bytes)
}

#[tokio::test]
async fn replicate_queue_repairs_to_three_replicas() {
    let cluster = TestCluster::with_zone(
        3,
        ZoneConfig {
            replication_factor: 3,
            ..Default::default()
        },
    )
    .await;

    replicate_first_range(&cluster, 3).await;

    cluster.put(b"replicated", b"everywhere").await.unwrap();
    // Followers apply asynchronously after the quorum commit.
    tokio::time::sleep(Duration::from_millis(100)).await;

    for i in 0..3 {
        assert_eq!(
            engine_get(&cluster, i, b"replicated"),
            Some(b"everywhere".to_vec()),
            "store {} is missing the replicated write",
            i + 1
        );
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn quorum_survives_losing_one_replica() {
    let cluster = TestCluster::with_zone(
        3,
        ZoneConfig {
            replication_factor: 3,
            ..Default::default()
        },
    )
    .await;
    replicate_first_range(&cluster, 3).await;

    // Store 3 drops off the transport.
    cluster.transport.disconnect(StoreId(3));

    cluster.put(b"after-loss", b"still-works").await.unwrap();
    assert_eq!(
        cluster.get(b"after-loss").await.unwrap(),
        Some(b"still-works".to_vec())
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn late_replica_catches_up_from_snapshot() {
    let cluster = TestCluster::with_zone(
        2,
        ZoneConfig {
            replication_factor: 2,
            ..Default::default()
        },
    )
    .await;

    // Build history on the single replica, then truncate the log so a
    // newcomer cannot be served by appends.
    for i in 0..20u8 {
        cluster.put(&[b'k', i], &[i; 8]).await.unwrap();
    }
    let replica = cluster.stores[0].replica(RangeId(1)).unwrap();
    let applied = replica.applied_index().unwrap();
    replica
        .send(Request::InternalTruncateLog(InternalTruncateLogRequest {
            header: RequestHeader {
                key: replica.descriptor().start_key.clone(),
                range_id: RangeId(1),
                ..Default::default()
            },
            index: applied,
        }))
        .await
        .unwrap();

    // The replicate queue adds store 2, which can only catch up through
    // a snapshot at the applied state.
    replicate_first_range(&cluster, 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    for i in 0..20u8 {
        assert_eq!(
            engine_get(&cluster, 1, &[b'k', i]),
            Some(vec![i; 8]),
            "store 2 is missing key {i} after snapshot catch-up"
        );
    }

    // And it participates in new commits.
    cluster.put(b"fresh", b"post-snapshot").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        engine_get(&cluster, 1, b"fresh"),
        Some(b"post-snapshot".to_vec())
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn engine_fault_marks_follower_dead() {
    let cluster = TestCluster::with_zone(
        3,
        ZoneConfig {
            replication_factor: 3,
            ..Default::default()
        },
    )
    .await;
    let monitor = StatusMonitor::new();
    for store in &cluster.stores {
        store.set_status_channel(monitor.sender());
    }
    replicate_first_range(&cluster, 3).await;

    // Store 3's device starts failing writes.
    cluster.fail_engine(2);

    // Writes keep committing on the surviving quorum.
    cluster.put(b"despite-fault", b"ok").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let dead = monitor.dead_replicas();
    assert!(
        dead.iter().any(|(store_id, _)| *store_id == StoreId(3)),
        "store 3's replica should have reported dead, got {dead:?}"
    );

    cluster.shutdown().await;
}
