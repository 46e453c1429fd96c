//! Store behavior: routing errors, restart recovery, version GC, and
//! stats verification.

mod common;

use common::{TestCluster, TEST_HEARTBEAT_TIMEOUT_NANOS};
use meridian::api::data::{NodeId, RangeId, StoreId};
use meridian::api::request::{GetRequest, Request, RequestHeader};
use meridian::core::config::ZoneConfig;
use meridian::core::error::Error;
use meridian::core::runtime::Stopper;
use meridian::range::queues;
use meridian::range::store::Store;

#[tokio::test]
async fn unknown_range_id_is_range_not_found() {
    let cluster = TestCluster::new(1).await;

    let mut header = RequestHeader::point(b"k".to_vec());
    header.range_id = RangeId(999);
    let err = cluster.stores[0]
        .send(Request::Get(GetRequest { header }))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::RangeNotFound {
            range_id: RangeId(999)
        }
    ));

    cluster.shutdown().await;
}

#[tokio::test]
async fn misrouted_span_reports_the_correct_descriptor() {
    let cluster = TestCluster::new(1).await;
    cluster.put(b"a", b"1").await.unwrap();
    cluster.stores[0]
        .admin_split(b"a", b"m".to_vec())
        .await
        .unwrap();

    // Address the left range by id with a key owned by the right one.
    let mut header = RequestHeader::point(b"z".to_vec());
    header.range_id = RangeId(1);
    let err = cluster.stores[0]
        .send(Request::Get(GetRequest { header }))
        .await
        .unwrap_err();
    match err {
        Error::RangeKeyMismatch { range, .. } => {
            let desc = range.expect("mismatch carries the descriptor");
            assert_eq!(desc.range_id, RangeId(1));
            assert_eq!(desc.end_key, b"m".to_vec());
        }
        other => panic!("expected RangeKeyMismatch, got {other:?}"),
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn restart_recovers_replicas_from_the_engine() {
    let cluster = TestCluster::new(1).await;
    cluster.put(b"persisted", b"survives").await.unwrap();
    cluster.stores[0]
        .admin_split(b"persisted", b"q".to_vec())
        .await
        .unwrap();
    cluster.wait_for_replicas(0, 2).await;
    let replica_count = cluster.stores[0].replicas().len();
    cluster.shutdown().await;

    // A new store over the same engine, as after a process restart.
    let stopper = Stopper::new();
    let transport = meridian::range::raft::LocalTransport::new();
    let restarted = Store::new(
        StoreId(1),
        NodeId(1),
        cluster.engines[0].clone(),
        cluster.clock.clone(),
        transport,
        stopper.clone(),
        ZoneConfig::default(),
        TEST_HEARTBEAT_TIMEOUT_NANOS,
    );
    restarted.start();
    let recovered = restarted.recover().unwrap();
    assert_eq!(recovered, replica_count);

    // Leadership is re-established explicitly after recovery.
    for replica in restarted.replicas() {
        replica.campaign().unwrap();
    }
    let replica = restarted
        .replicas()
        .into_iter()
        .find(|r| r.descriptor().contains_key(b"persisted"))
        .expect("covering replica");
    let mut header = RequestHeader::point(b"persisted".to_vec());
    header.range_id = replica.range_id();
    let response = restarted
        .send(Request::Get(GetRequest { header }))
        .await
        .unwrap();
    match response {
        meridian::api::request::Response::Get(resp) => {
            assert_eq!(resp.value.unwrap().bytes, Some(b"survives".to_vec()));
        }
        other => panic!("unexpected response {:?}", other.method()),
    }

    stopper.stop(std::time::Duration::from_secs(1)).await;
}

#[tokio::test]
async fn gc_queue_drops_superseded_versions() {
    let zone = ZoneConfig {
        gc_ttl_seconds: 0,
        ..Default::default()
    };
    let cluster = TestCluster::with_zone(1, zone).await;

    cluster.put(b"k", b"old").await.unwrap();
    cluster.put(b"k", b"new").await.unwrap();
    let before = cluster.engines[0].len();

    queues::gc_scan(cluster.stores[0].clone()).await;

    // The superseded version is gone; the live one still reads.
    assert!(cluster.engines[0].len() < before);
    assert_eq!(cluster.get(b"k").await.unwrap(), Some(b"new".to_vec()));

    cluster.shutdown().await;
}

#[tokio::test]
async fn verify_queue_accepts_a_consistent_store() {
    let cluster = TestCluster::new(1).await;
    for c in b'a'..=b'h' {
        cluster.put(&[c], &[c; 8]).await.unwrap();
    }
    cluster.delete(b"c").await.unwrap();

    // The scan recomputes stats and finds them matching the maintained
    // counters; divergence would log an error and is asserted against in
    // the MVCC unit tests.
    queues::verify_scan(cluster.stores[0].clone()).await;

    cluster.shutdown().await;
}
