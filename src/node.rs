//! Node assembly.
//!
//! A node owns one clock, one stopper, and one or more stores (one per
//! storage device), wires them to the distributed sender, and serves the
//! public wire endpoint. Start order: stores → sender → queues →
//! listener; shutdown reverses it through the stopper.

use crate::api::data::{NodeId, RangeDescriptor, ReplicaId, ReplicaDescriptor, StoreId};
use crate::core::clock::Clock;
use crate::core::config::Config;
use crate::core::retry::RetryOptions;
use crate::core::runtime::Stopper;
use crate::dist::sender::DistSender;
use crate::dist::KvSender;
use crate::net::security::SecurityConfig;
use crate::net::server::Server;
use crate::ops::status::StatusMonitor;
use crate::range::queues::{spawn_queues, QueueIntervals};
use crate::range::raft::LocalTransport;
use crate::range::store::Store;
use crate::storage::engine::MemEngine;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A running node.
pub struct Node {
    config: Config,
    clock: Arc<Clock>,
    stopper: Arc<Stopper>,
    stores: Vec<Arc<Store>>,
    sender: DistSender,
    status: Arc<StatusMonitor>,
    first_range: RangeDescriptor,
}

impl Node {
    /// Build and start a node from configuration: stores, sender wiring,
    /// bootstrap (on empty engines), and background queues.
    pub async fn start(config: Config) -> Result<Self> {
        config.validate()?;
        let stopper = Stopper::new();
        let clock = Arc::new(Clock::system(
            config.node.max_clock_offset_ms as i64 * 1_000_000,
        ));
        let transport = LocalTransport::new();
        let status = Arc::new(StatusMonitor::new());
        let sender = DistSender::new(clock.clone(), RetryOptions::default());
        let node_id = NodeId(1);
        let heartbeat_timeout_nanos = config.txn.heartbeat_timeout_ms as i64 * 1_000_000;

        let mut stores = Vec::new();
        for i in 1..=config.node.store_count {
            let store = Store::new(
                StoreId(i),
                node_id,
                MemEngine::new(),
                clock.clone(),
                transport.clone(),
                stopper.clone(),
                config.zone.clone(),
                heartbeat_timeout_nanos,
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
            store.set_status_channel(status.sender());
            store.set_peer_stores(peers.clone());
        }

        let first = stores.first().context("node has no stores")?;
        let first_range = first.bootstrap()?;
        sender.seed(first_range.clone());

        for store in &stores {
            spawn_queues(store, &stopper, QueueIntervals::default());
        }

        info!(stores = stores.len(), "node started");
        Ok(Self {
            config,
            clock,
            stopper,
            stores,
            sender,
            status,
            first_range,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn stopper(&self) -> &Arc<Stopper> {
        &self.stopper
    }

    pub fn stores(&self) -> &[Arc<Store>] {
        &self.stores
    }

    pub fn status(&self) -> &Arc<StatusMonitor> {
        &self.status
    }

    /// Descriptor of the first range, for seeding clients.
    pub fn first_range(&self) -> &RangeDescriptor {
        &self.first_range
    }

    /// The cluster sender, for internal clients that bypass the wire API.
    pub fn kv(&self) -> Arc<dyn KvSender> {
        Arc::new(self.sender.clone())
    }

    /// Bind and serve the public wire endpoint.
    pub async fn serve(&self) -> Result<std::net::SocketAddr> {
        let security = if self.config.node.insecure {
            SecurityConfig::insecure()
        } else {
            SecurityConfig::secure(&self.config.node.certs_dir)
        };
        let server = Server::new(self.kv(), security, self.stopper.clone());
        server.serve(&self.config.node.addr).await
    }

    /// Drain in-flight work and stop all workers.
    pub async fn stop(&self) {
        self.stopper.stop(Duration::from_secs(5)).await;
        info!("node stopped");
    }
}
