//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use meridian::api::data::{NodeId, RangeDescriptor, ReplicaDescriptor, ReplicaId, StoreId, Value};
use meridian::api::request::{
    DeleteRequest, GetRequest, IncrementRequest, PutRequest, Request, RequestHeader, Response,
    ScanRequest,
};
use meridian::core::clock::Clock;
use meridian::core::config::ZoneConfig;
use meridian::core::error::Result;
use meridian::core::retry::RetryOptions;
use meridian::core::runtime::Stopper;
use meridian::dist::sender::DistSender;
use meridian::dist::KvSender;
use meridian::range::raft::LocalTransport;
use meridian::range::store::Store;
use meridian::storage::engine::MemEngine;
use std::sync::Arc;
use std::time::Duration;

/// Transaction heartbeat timeout used across tests; short so expiry
/// paths are reachable.
pub const TEST_HEARTBEAT_TIMEOUT_NANOS: i64 = 500_000_000;

/// An in-process cluster: stores sharing one transport and clock, routed
/// through a distributed sender.
pub struct TestCluster {
    pub clock: Arc<Clock>,
    pub stopper: Arc<Stopper>,
    pub transport: Arc<LocalTransport>,
    pub stores: Vec<Arc<Store>>,
    pub engines: Vec<Arc<MemEngine>>,
    pub sender: DistSender,
    pub first_range: RangeDescriptor,
}

impl TestCluster {
    /// Build a cluster of `num_stores` stores and bootstrap the first
    /// range on the first one.
    pub async fn new(num_stores: u32) -> Self {
        Self::with_zone(num_stores, ZoneConfig::default()).await
    }

    pub async fn with_zone(num_stores: u32, zone: ZoneConfig) -> Self {
        let stopper = Stopper::new();
        let clock = Arc::new(Clock::system(0));
        let transport = LocalTransport::new();
        let sender = DistSender::new(clock.clone(), RetryOptions::fast());
        let node_id = NodeId(1);

        let mut stores = Vec::new();
        let mut engines = Vec::new();
        for i in 1..=num_stores {
            let engine = MemEngine::new();
            engines.push(Arc::clone(&engine));
            let store = Store::new(
                StoreId(i),
                node_id,
                engine,
                clock.clone(),
                transport.clone(),
                stopper.clone(),
                zone.clone(),
                TEST_HEARTBEAT_TIMEOUT_NANOS,
            );
            store.start();
            sender.add_store(Arc::clone(&store));
            stores.push(store);
        }

        let db: Arc<dyn KvSender> = Arc::new(sender.clone());
        let peers: Vec<ReplicaDescriptor> = stores
            .iter()
            .map(|s| ReplicaDescriptor {
                node_id,
                store_id: s.store_id(),
                replica_id: ReplicaId(0),
            })
            .collect();
        for store in &stores {
            store.set_db(db.clone());
            store.set_peer_stores(peers.clone());
        }

        let first_range = stores[0].bootstrap().expect("bootstrap");
        sender.seed(first_range.clone());

        TestCluster {
            clock,
            stopper,
            transport,
            stores,
            engines,
            sender,
            first_range,
        }
    }

    /// Inject write failures into the given store's engine.
    pub fn fail_engine(&self, store_index: usize) {
        self.engines[store_index].set_fail_writes(true);
    }

    /// Wait until a store hosts exactly `count` replicas. Replica
    /// materialization after splits and merges runs through the store
    /// event loop, a beat behind the admin call returning.
    pub async fn wait_for_replicas(&self, store_index: usize, count: usize) {
        for _ in 0..200 {
            if self.stores[store_index].replicas().len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "store {} never reached {} replicas (has {})",
            store_index + 1,
            count,
            self.stores[store_index].replicas().len()
        );
    }

    /// The cluster sender as a trait object, for coordinators.
    pub fn db(&self) -> Arc<dyn KvSender> {
        Arc::new(self.sender.clone())
    }

    pub async fn shutdown(&self) {
        self.stopper.stop(Duration::from_secs(1)).await;
    }

    // Non-transactional convenience operations.

    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.sender
            .submit(Request::Put(PutRequest {
                header: RequestHeader::point(key.to_vec()),
                value: Value::from_bytes(value.to_vec()),
            }))
            .await
            .map(|_| ())
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let response = self
            .sender
            .submit(Request::Get(GetRequest {
                header: RequestHeader::point(key.to_vec()),
            }))
            .await?;
        match response {
            Response::Get(resp) => Ok(resp.value.and_then(|v| v.bytes)),
            other => panic!("unexpected response {:?}", other.method()),
        }
    }

    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        self.sender
            .submit(Request::Delete(DeleteRequest {
                header: RequestHeader::point(key.to_vec()),
            }))
            .await
            .map(|_| ())
    }

    pub async fn increment(&self, key: &[u8], delta: i64) -> Result<i64> {
        let response = self
            .sender
            .submit(Request::Increment(IncrementRequest {
                header: RequestHeader::point(key.to_vec()),
                increment: delta,
            }))
            .await?;
        match response {
            Response::Increment(resp) => Ok(resp.new_value),
            other => panic!("unexpected response {:?}", other.method()),
        }
    }

    /// Scan user keys, returning (key, bytes) pairs.
    pub async fn scan(&self, start: &[u8], end: &[u8], max: u64) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let response = self
            .sender
            .submit(Request::Scan(ScanRequest {
                header: RequestHeader::span(start.to_vec(), end.to_vec()),
                max_results: max,
            }))
            .await?;
        match response {
            Response::Scan(resp) => Ok(resp
                .rows
                .into_iter()
                .map(|kv| (kv.key, kv.value.bytes.unwrap_or_default()))
                .collect()),
            other => panic!("unexpected response {:?}", other.method()),
        }
    }
}
