//! Transaction protocol: commit visibility, conflicts, pushes, and
//! cross-range recovery through intent resolution.

mod common;

use common::{TestCluster, TEST_HEARTBEAT_TIMEOUT_NANOS};
use meridian::api::data::{Isolation, Transaction, TxnStatus, Value};
use meridian::api::request::{
    EndTransactionRequest, GetRequest, PutRequest, Request, RequestHeader, Response,
};
use meridian::core::error::Error;
use meridian::storage::keys;
use meridian::txn::{run_transaction, Txn, TxnOptions};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn serializable(cluster: &TestCluster, name: &str) -> Transaction {
    Transaction::new(name, Isolation::Serializable, cluster.clock.now(), 0)
}

async fn txn_put(cluster: &TestCluster, txn: &Transaction, key: &[u8], value: &[u8]) -> Result<Transaction, Error> {
    let mut header = RequestHeader::point(key.to_vec());
    header.txn = Some(txn.clone());
    let response = cluster
        .sender
        .submit(Request::Put(PutRequest {
            header,
            value: Value::from_bytes(value.to_vec()),
        }))
        .await?;
    Ok(response.header().txn.clone().expect("txn echo"))
}

async fn txn_heartbeat(cluster: &TestCluster, txn: &Transaction) -> Result<Transaction, Error> {
    let mut header = RequestHeader::point(keys::transaction_key(txn.id));
    header.txn = Some(txn.clone());
    let response = cluster
        .sender
        .submit(Request::InternalHeartbeatTxn(
            meridian::api::request::InternalHeartbeatTxnRequest {
                header,
                now: cluster.clock.now(),
            },
        ))
        .await?;
    Ok(response.header().txn.clone().expect("txn echo"))
}

async fn txn_end(
    cluster: &TestCluster,
    txn: &Transaction,
    commit: bool,
) -> Result<Transaction, Error> {
    let mut header = RequestHeader::point(keys::transaction_key(txn.id));
    header.txn = Some(txn.clone());
    let response = cluster
        .sender
        .submit(Request::EndTransaction(EndTransactionRequest {
            header,
            commit,
            intents: vec![],
        }))
        .await?;
    Ok(response.header().txn.clone().expect("txn echo"))
}

#[tokio::test]
async fn commit_makes_writes_visible() {
    let cluster = TestCluster::new(1).await;
    let db = cluster.db();

    run_transaction(
        db,
        cluster.clock.clone(),
        TEST_HEARTBEAT_TIMEOUT_NANOS,
        TxnOptions {
            name: "writer".to_string(),
            isolation: Isolation::Serializable,
        },
        |t: &mut Txn| {
            Box::pin(async move {
                t.put(b"k1", Value::from_bytes(b"v1".to_vec())).await?;
                t.put(b"k2", Value::from_bytes(b"v2".to_vec())).await?;
                Ok(())
            })
        },
    )
    .await
    .unwrap();

    // Async resolution may lag; readers push through any leftover intent.
    assert_eq!(cluster.get(b"k1").await.unwrap(), Some(b"v1".to_vec()));
    assert_eq!(cluster.get(b"k2").await.unwrap(), Some(b"v2".to_vec()));

    cluster.shutdown().await;
}

#[tokio::test]
async fn rolled_back_writes_stay_invisible() {
    let cluster = TestCluster::new(1).await;
    let db = cluster.db();

    let result = run_transaction(
        db,
        cluster.clock.clone(),
        TEST_HEARTBEAT_TIMEOUT_NANOS,
        TxnOptions {
            name: "aborter".to_string(),
            isolation: Isolation::Serializable,
        },
        |t: &mut Txn| {
            Box::pin(async move {
                t.put(b"doomed", Value::from_bytes(b"x".to_vec())).await?;
                Err(Error::internal("caller gives up"))
            })
        },
    )
    .await;
    assert!(result.is_err());

    assert_eq!(cluster.get(b"doomed").await.unwrap(), None);
    cluster.shutdown().await;
}

#[tokio::test]
async fn transactional_reads_see_own_writes() {
    let cluster = TestCluster::new(1).await;
    let db = cluster.db();

    run_transaction(
        db,
        cluster.clock.clone(),
        TEST_HEARTBEAT_TIMEOUT_NANOS,
        TxnOptions {
            name: "read-own".to_string(),
            isolation: Isolation::Serializable,
        },
        |t: &mut Txn| {
            Box::pin(async move {
                t.put(b"pending", Value::from_bytes(b"mine".to_vec())).await?;
                let value = t.get(b"pending").await?;
                assert_eq!(value.unwrap().bytes, Some(b"mine".to_vec()));
                Ok(())
            })
        },
    )
    .await
    .unwrap();

    cluster.shutdown().await;
}

#[tokio::test]
async fn higher_priority_writer_aborts_lower() {
    let cluster = TestCluster::new(1).await;

    // Txn A (low priority) creates its record and leaves an intent on k.
    let mut a = serializable(&cluster, "low");
    a.priority = 1;
    let a = txn_heartbeat(&cluster, &a).await.unwrap();
    let a = txn_put(&cluster, &a, b"k", b"from-a").await.unwrap();

    // Txn B (high priority) writes k: the conflict pushes A out of the
    // way and B's write lands.
    let mut b = serializable(&cluster, "high");
    b.priority = 1_000_000;
    let b = txn_put(&cluster, &b, b"k", b"from-b").await.unwrap();
    let b = txn_end(&cluster, &b, true).await.unwrap();
    assert_eq!(b.status, TxnStatus::Committed);

    // A finds out it was aborted when it tries to finish.
    let err = txn_end(&cluster, &a, true).await.unwrap_err();
    assert!(matches!(err, Error::TransactionAborted { .. }), "got {err:?}");

    // Resolve B's intent lazily via a plain read.
    assert_eq!(cluster.get(b"k").await.unwrap(), Some(b"from-b".to_vec()));

    cluster.shutdown().await;
}

#[tokio::test]
async fn conflicting_writers_both_eventually_commit() {
    let cluster = TestCluster::new(1).await;
    let committed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for name in ["first", "second"] {
        let db = cluster.db();
        let clock = cluster.clock.clone();
        let committed = Arc::clone(&committed);
        handles.push(tokio::spawn(async move {
            run_transaction(
                db,
                clock,
                TEST_HEARTBEAT_TIMEOUT_NANOS,
                TxnOptions {
                    name: name.to_string(),
                    isolation: Isolation::Serializable,
                },
                |t: &mut Txn| {
                    Box::pin(async move {
                        t.increment(b"contended", 1).await?;
                        Ok(())
                    })
                },
            )
            .await
            .unwrap();
            committed.fetch_add(1, Ordering::SeqCst);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(committed.load(Ordering::SeqCst), 2);

    // Both increments took effect exactly once.
    let response = cluster
        .sender
        .submit(Request::Get(GetRequest {
            header: RequestHeader::point(b"contended".to_vec()),
        }))
        .await
        .unwrap();
    match response {
        Response::Get(resp) => assert_eq!(resp.value.unwrap().integer, Some(2)),
        other => panic!("unexpected response {:?}", other.method()),
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn cross_range_commit_recovers_via_push() {
    let cluster = TestCluster::new(1).await;

    // Two ranges: [ .. m) and [m .. ).
    cluster.put(b"a", b"seed").await.unwrap();
    cluster.put(b"z", b"seed").await.unwrap();
    cluster.stores[0]
        .admin_split(b"a", b"m".to_vec())
        .await
        .unwrap();

    // A transaction writes on both sides of the split, then its record
    // flips to committed without any intent resolution, as if the
    // coordinator crashed right after commit.
    let txn = serializable(&cluster, "crash-after-commit");
    let txn = txn_put(&cluster, &txn, b"a", b"txn-a").await.unwrap();
    let txn = txn_put(&cluster, &txn, b"z", b"txn-z").await.unwrap();
    let committed = txn_end(&cluster, &txn, true).await.unwrap();
    assert_eq!(committed.status, TxnStatus::Committed);

    // A later reader at the second range trips over the intent, checks
    // the record, learns it committed, resolves, and reads the value.
    assert_eq!(cluster.get(b"z").await.unwrap(), Some(b"txn-z".to_vec()));
    assert_eq!(cluster.get(b"a").await.unwrap(), Some(b"txn-a".to_vec()));

    cluster.shutdown().await;
}

#[tokio::test]
async fn expired_transactions_can_be_pushed_aside() {
    let cluster = TestCluster::new(1).await;

    // A writer with a record and an intent whose coordinator stops
    // heartbeating.
    let abandoned = serializable(&cluster, "abandoned");
    let abandoned = txn_heartbeat(&cluster, &abandoned).await.unwrap();
    txn_put(&cluster, &abandoned, b"stuck", b"limbo").await.unwrap();

    // Wait past the heartbeat timeout so the record counts as abandoned.
    tokio::time::sleep(std::time::Duration::from_nanos(
        TEST_HEARTBEAT_TIMEOUT_NANOS as u64 + 100_000_000,
    ))
    .await;

    // An ordinary read pushes the abandoned writer and proceeds.
    assert_eq!(cluster.get(b"stuck").await.unwrap(), None);

    cluster.shutdown().await;
}

#[tokio::test]
async fn serializable_commit_restarts_when_pushed() {
    let cluster = TestCluster::new(1).await;
    let attempts = Arc::new(AtomicUsize::new(0));

    // Warm a read timestamp above the writer's provisional timestamp by
    // reading the key right before the transactional write.
    let db = cluster.db();
    let clock = cluster.clock.clone();
    let reader = cluster.sender.clone();
    let attempts_in_body = Arc::clone(&attempts);
    run_transaction(
        db,
        clock,
        TEST_HEARTBEAT_TIMEOUT_NANOS,
        TxnOptions {
            name: "pushed-writer".to_string(),
            isolation: Isolation::Serializable,
        },
        move |t: &mut Txn| {
            let reader = reader.clone();
            let attempts = Arc::clone(&attempts_in_body);
            Box::pin(async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    // A read at a later timestamp forces the writer's
                    // commit timestamp forward on its first attempt.
                    let _ = reader
                        .submit(Request::Get(GetRequest {
                            header: RequestHeader::point(b"contested".to_vec()),
                        }))
                        .await?;
                }
                t.put(b"contested", Value::from_bytes(b"final".to_vec())).await?;
                Ok(())
            })
        },
    )
    .await
    .unwrap();

    // The pushed first attempt restarted; the second committed.
    assert!(attempts.load(Ordering::SeqCst) >= 2, "writer was never pushed");
    assert_eq!(cluster.get(b"contested").await.unwrap(), Some(b"final".to_vec()));

    cluster.shutdown().await;
}
