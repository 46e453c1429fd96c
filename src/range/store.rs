//! A store: one engine's worth of replicas.
//!
//! The store routes incoming commands to the replica owning their key
//! span, enforces span containment against the replica's current
//! descriptor, materializes replicas on bootstrap, restart, and split,
//! and orchestrates the admin operations (split, merge, replica changes)
//! whose metadata updates run as distributed transactions.

use crate::api::data::{
    pretty_key, Key, NodeId, RangeDescriptor, RangeId, ReplicaDescriptor, ReplicaId, StoreId,
    Value,
};
use crate::api::request::{
    AdminMergeResponse, AdminSplitResponse, InternalChangeReplicasRequest, InternalMergeRequest,
    InternalSplitRequest, ReplicaChange, Request, RequestHeader, Response, ResponseHeader,
};
use crate::core::clock::Clock;
use crate::core::config::ZoneConfig;
use crate::core::error::{Error, Result};
use crate::core::runtime::Stopper;
use crate::range::raft::{LocalTransport, RaftEnvelope, RaftTransport};
use crate::range::replica::{Replica, StoreEvent};
use crate::storage::engine::{Engine, WriteBatch};
use crate::storage::keys;
use crate::storage::mvcc;
use crate::txn;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Key of the cluster-wide range id allocator.
pub const RANGE_ID_GENERATOR_KEY: &[u8] = b"\x00range-idgen";

/// A collection of replicas co-located on one engine.
pub struct Store {
    store_id: StoreId,
    node_id: NodeId,
    engine: Arc<dyn Engine>,
    clock: Arc<Clock>,
    transport: Arc<LocalTransport>,
    stopper: Arc<Stopper>,

    replicas: RwLock<BTreeMap<RangeId, Arc<Replica>>>,
    events_tx: mpsc::UnboundedSender<StoreEvent>,
    events_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<StoreEvent>>>,

    default_zone: ZoneConfig,
    heartbeat_timeout_nanos: i64,

    /// Cluster-wide sender for transactional metadata updates; wired in
    /// after the distributed sender exists.
    db: RwLock<Option<Arc<dyn crate::dist::KvSender>>>,

    /// Stores eligible as rebalance/repair targets, registered by the
    /// node.
    peer_stores: RwLock<Vec<ReplicaDescriptor>>,

    /// Dead-replica reports for operational tooling.
    status_tx: RwLock<Option<mpsc::UnboundedSender<crate::ops::status::StatusEvent>>>,
}

impl Store {
    pub fn new(
        store_id: StoreId,
        node_id: NodeId,
        engine: Arc<dyn Engine>,
        clock: Arc<Clock>,
        transport: Arc<LocalTransport>,
        stopper: Arc<Stopper>,
        default_zone: ZoneConfig,
        heartbeat_timeout_nanos: i64,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            store_id,
            node_id,
            engine,
            clock,
            transport,
            stopper,
            replicas: RwLock::new(BTreeMap::new()),
            events_tx,
            events_rx: parking_lot::Mutex::new(Some(events_rx)),
            default_zone,
            heartbeat_timeout_nanos,
            db: RwLock::new(None),
            peer_stores: RwLock::new(Vec::new()),
            status_tx: RwLock::new(None),
        })
    }

    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// Wire the cluster-wide sender used for transactional metadata
    /// updates (split and merge addressing records).
    pub fn set_db(&self, db: Arc<dyn crate::dist::KvSender>) {
        *self.db.write() = Some(db);
    }

    /// Register peer stores as replication targets.
    pub fn set_peer_stores(&self, peers: Vec<ReplicaDescriptor>) {
        *self.peer_stores.write() = peers;
    }

    /// Attach the node status channel for dead-replica reports.
    pub fn set_status_channel(&self, tx: mpsc::UnboundedSender<crate::ops::status::StatusEvent>) {
        *self.status_tx.write() = Some(tx);
    }

    /// The zone configuration in effect: the stored system record when
    /// present, the compiled default otherwise.
    pub fn zone_config(&self) -> ZoneConfig {
        let stored = mvcc::get(
            self.engine.as_reader(),
            keys::ZONE_CONFIG_KEY,
            crate::core::clock::Timestamp::max(),
            None,
        )
        .ok()
        .flatten()
        .and_then(|v| v.bytes)
        .and_then(|raw| bincode::deserialize(&raw).ok());
        stored.unwrap_or_else(|| self.default_zone.clone())
    }

    /// Write the first range covering the whole keyspace, its addressing
    /// records, the default zone configuration, and the range id
    /// allocator. Only legal on an empty engine.
    pub fn bootstrap(self: &Arc<Self>) -> Result<RangeDescriptor> {
        let now = self.clock.now();
        let now_nanos = now.wall_time;
        let replica = ReplicaDescriptor {
            node_id: self.node_id,
            store_id: self.store_id,
            replica_id: ReplicaId(1),
        };
        let desc = RangeDescriptor {
            range_id: RangeId(1),
            start_key: keys::KEY_MIN.to_vec(),
            end_key: keys::KEY_MIN.to_vec(),
            replicas: vec![replica],
            next_replica_id: ReplicaId(2),
        };

        let mut batch = WriteBatch::new();
        let mut stats = crate::api::data::MvccStats {
            last_update_nanos: now_nanos,
            ..Default::default()
        };
        let base = self.engine.as_reader();

        // Addressing: meta1 and meta2 entries, both keyed at the maximum
        // since the range covers everything.
        let desc_value = Value::from_bytes(
            bincode::serialize(&desc)
                .map_err(|e| Error::internal(format!("encode descriptor: {}", e)))?,
        );
        let mut meta1 = keys::META1_PREFIX.to_vec();
        meta1.extend_from_slice(keys::KEY_MAX);
        mvcc::put(base, &mut batch, &mut stats, &meta1, now, desc_value.clone(), None, now_nanos)?;
        mvcc::put(
            base,
            &mut batch,
            &mut stats,
            &keys::range_addressing_key(&desc.end_key),
            now,
            desc_value,
            None,
            now_nanos,
        )?;

        // Default zone configuration and the range id allocator.
        mvcc::put(
            base,
            &mut batch,
            &mut stats,
            keys::ZONE_CONFIG_KEY,
            now,
            Value::from_bytes(
                bincode::serialize(&self.default_zone)
                    .map_err(|e| Error::internal(format!("encode zone config: {}", e)))?,
            ),
            None,
            now_nanos,
        )?;
        mvcc::put(
            base,
            &mut batch,
            &mut stats,
            RANGE_ID_GENERATOR_KEY,
            now,
            Value::from_integer(1),
            None,
            now_nanos,
        )?;

        batch.put(
            keys::range_descriptor_key(desc.range_id),
            bincode::serialize(&desc)
                .map_err(|e| Error::internal(format!("encode descriptor: {}", e)))?,
        );
        batch.put(
            keys::range_stats_key(desc.range_id),
            bincode::serialize(&stats)
                .map_err(|e| Error::internal(format!("encode stats: {}", e)))?,
        );
        self.engine.write(batch)?;

        let replica = self.create_replica(desc.clone())?;
        replica.campaign()?;
        info!(store_id = %self.store_id, "bootstrapped first range");
        Ok(desc)
    }

    /// Enumerate persisted range descriptors and materialize replicas.
    /// Called on restart instead of [`Self::bootstrap`].
    pub fn recover(self: &Arc<Self>) -> Result<usize> {
        let mut count = 0;
        let local_end = keys::prefix_end(keys::LOCAL_PREFIX);
        for (key, raw) in self.engine.scan(keys::LOCAL_PREFIX, &local_end, 0)? {
            if !key.ends_with(b"desc") {
                continue;
            }
            let desc: RangeDescriptor = bincode::deserialize(&raw)
                .map_err(|e| Error::internal(format!("decode descriptor: {}", e)))?;
            if desc.find_replica(self.store_id).is_none() {
                continue;
            }
            self.create_replica(desc)?;
            count += 1;
        }
        info!(store_id = %self.store_id, ranges = count, "recovered replicas from engine");
        Ok(count)
    }

    /// Start the raft delivery and store event workers.
    pub fn start(self: &Arc<Self>) {
        let mut raft_rx = self.transport.listen(self.store_id);
        let store = Arc::clone(self);
        let mut shutdown = self.stopper.shutdown_signal();
        self.stopper.spawn(format!("raft-recv-{}", self.store_id), async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    envelope = raft_rx.recv() => match envelope {
                        Some(envelope) => store.deliver_raft(envelope),
                        None => break,
                    },
                }
            }
        });

        let store = Arc::clone(self);
        let mut events_rx = self
            .events_rx
            .lock()
            .take()
            .expect("store event loop started twice");
        let mut shutdown = self.stopper.shutdown_signal();
        self.stopper.spawn(format!("store-events-{}", self.store_id), async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events_rx.recv() => match event {
                        Some(event) => store.handle_event(event),
                        None => break,
                    },
                }
            }
        });
    }

    fn deliver_raft(self: &Arc<Self>, envelope: RaftEnvelope) {
        let replica = self.replicas.read().get(&envelope.range_id).cloned();
        match replica {
            Some(replica) => {
                if let Err(e) = replica.raft().step(envelope.from, envelope.message) {
                    // Failing to persist consensus state is as fatal as
                    // failing to apply: the replica stops.
                    warn!(range_id = %envelope.range_id, error = %e, "raft step failed");
                    replica.fatal(e);
                }
            }
            None => {
                // Messages for a range we do not host yet. A snapshot
                // bootstraps the replica; anything else has nothing to
                // land on and is dropped.
                if let crate::range::raft::RaftMessage::Snapshot { .. } = &envelope.message {
                    if let Err(e) = self.bootstrap_from_snapshot(envelope) {
                        warn!(error = %e, "failed to bootstrap replica from snapshot");
                    }
                } else {
                    debug!(range_id = %envelope.range_id, "dropping raft message for unknown range");
                }
            }
        }
    }

    fn bootstrap_from_snapshot(self: &Arc<Self>, envelope: RaftEnvelope) -> Result<()> {
        let crate::range::raft::RaftMessage::Snapshot { ref snapshot, .. } = envelope.message
        else {
            return Ok(());
        };
        // Lay down the leader's records first so the new replica recovers
        // its descriptor and state from the engine.
        let mut batch = WriteBatch::new();
        for (k, v) in &snapshot.pairs {
            batch.put(k.clone(), v.clone());
        }
        batch.put(
            keys::range_applied_index_key(snapshot.range_id),
            bincode::serialize(&snapshot.last_index)
                .map_err(|e| Error::internal(format!("encode applied index: {}", e)))?,
        );
        self.engine.write(batch)?;

        let range_id = snapshot.range_id;
        let raw = self
            .engine
            .get(&keys::range_descriptor_key(range_id))?
            .ok_or_else(|| Error::internal("snapshot carried no range descriptor"))?;
        let desc: RangeDescriptor = bincode::deserialize(&raw)
            .map_err(|e| Error::internal(format!("decode descriptor: {}", e)))?;
        let replica = self.create_replica(desc)?;
        replica.raft().step(envelope.from, envelope.message)?;
        info!(range_id = %range_id, store_id = %self.store_id, "bootstrapped replica from snapshot");
        Ok(())
    }

    fn handle_event(self: &Arc<Self>, event: StoreEvent) {
        match event {
            StoreEvent::SplitApplied { parent, new_desc } => {
                let lead = self
                    .replicas
                    .read()
                    .get(&parent)
                    .map(|r| r.raft().is_leader())
                    .unwrap_or(false);
                match self.create_replica(new_desc.clone()) {
                    Ok(replica) => {
                        // The parent's leader seeds leadership of the new
                        // range so it is immediately serviceable. Peer
                        // replicas materialize through their own stores'
                        // event loops, so the campaign retries until the
                        // group has a leader.
                        if lead {
                            let range_id = new_desc.range_id;
                            self.stopper.spawn(
                                format!("campaign-{}-{}", self.store_id, range_id),
                                async move {
                                    for _ in 0..50 {
                                        if replica.raft().is_leader()
                                            || replica.raft().leader().is_some()
                                        {
                                            return;
                                        }
                                        if let Err(e) = replica.campaign() {
                                            warn!(range_id = %range_id, error = %e, "campaign failed");
                                            return;
                                        }
                                        tokio::time::sleep(
                                            std::time::Duration::from_millis(20),
                                        )
                                        .await;
                                    }
                                },
                            );
                        }
                    }
                    Err(e) => {
                        warn!(range_id = %new_desc.range_id, error = %e, "failed to create split replica")
                    }
                }
            }
            StoreEvent::MergeApplied { parent, subsumed } => {
                debug!(parent = %parent, subsumed = %subsumed, "dropping subsumed replica");
                self.replicas.write().remove(&subsumed);
            }
            StoreEvent::ReplicasChanged { range_id } => {
                debug!(range_id = %range_id, "replica set changed");
            }
            StoreEvent::ReplicaDead { range_id, message } => {
                warn!(range_id = %range_id, message = %message, "replica died");
                if let Some(tx) = self.status_tx.read().as_ref() {
                    let _ = tx.send(crate::ops::status::StatusEvent::ReplicaDead {
                        store_id: self.store_id,
                        range_id,
                        message,
                    });
                }
            }
        }
    }

    /// Materialize a replica for `desc` and start its apply loop.
    pub fn create_replica(self: &Arc<Self>, desc: RangeDescriptor) -> Result<Arc<Replica>> {
        let range_id = desc.range_id;
        if let Some(existing) = self.replicas.read().get(&range_id) {
            return Ok(Arc::clone(existing));
        }
        let this = *desc
            .find_replica(self.store_id)
            .ok_or_else(|| Error::internal(format!("store {} not in {}", self.store_id, desc)))?;
        let (replica, events) = Replica::new(
            desc,
            this,
            self.engine.clone(),
            self.clock.clone(),
            self.transport.clone() as Arc<dyn RaftTransport>,
            self.heartbeat_timeout_nanos,
            self.events_tx.clone(),
        )?;
        self.replicas.write().insert(range_id, Arc::clone(&replica));

        let apply = Arc::clone(&replica);
        let shutdown = self.stopper.shutdown_signal();
        self.stopper.spawn(
            format!("apply-{}-{}", self.store_id, range_id),
            apply.run_apply(events, shutdown),
        );
        Ok(replica)
    }

    /// All resident replicas, in range id order.
    pub fn replicas(&self) -> Vec<Arc<Replica>> {
        self.replicas.read().values().cloned().collect()
    }

    /// The resident replica for a range id.
    pub fn replica(&self, range_id: RangeId) -> Option<Arc<Replica>> {
        self.replicas.read().get(&range_id).cloned()
    }

    /// Drop a replica and delete its bookkeeping, after its range was
    /// re-parented elsewhere. Used by the range GC queue.
    pub fn remove_replica(&self, range_id: RangeId) -> Result<()> {
        let Some(_replica) = self.replicas.write().remove(&range_id) else {
            return Ok(());
        };
        let mut batch = WriteBatch::new();
        let local_prefix = {
            let mut p = keys::LOCAL_PREFIX.to_vec();
            p.extend_from_slice(&range_id.0.to_be_bytes());
            p
        };
        for (k, _) in self.engine.scan(&local_prefix, &keys::prefix_end(&local_prefix), 0)? {
            batch.delete(k);
        }
        self.engine.write(batch)?;
        info!(range_id = %range_id, store_id = %self.store_id, "removed replica");
        Ok(())
    }

    /// Route one request to the owning replica.
    pub async fn send(&self, request: Request) -> Result<Response> {
        let _guard = self.stopper.run_task().ok_or(Error::NodeUnavailable)?;

        if request.is_admin() {
            return self.send_admin(request).await;
        }

        let replica = self.resolve_replica(request.header())?;
        let desc = replica.descriptor();
        let (start, end) = request.key_span();
        // A ranged request with an empty end key runs to the end of the
        // keyspace; the sender must have truncated it to our span.
        let effective_end: &[u8] = if request.is_ranged() && end.is_empty() {
            keys::KEY_MAX
        } else {
            end
        };
        if !desc.contains_key_range(start, effective_end) {
            return Err(Error::RangeKeyMismatch {
                request_start_key: start.to_vec(),
                request_end_key: end.to_vec(),
                range: Some(desc),
            });
        }
        replica.send(request).await
    }

    fn resolve_replica(&self, header: &RequestHeader) -> Result<Arc<Replica>> {
        if header.range_id != RangeId(0) {
            return self
                .replica(header.range_id)
                .ok_or(Error::RangeNotFound {
                    range_id: header.range_id,
                });
        }
        let replicas = self.replicas.read();
        for replica in replicas.values() {
            if replica.descriptor().contains_key(&header.key) {
                return Ok(Arc::clone(replica));
            }
        }
        Err(Error::RangeKeyMismatch {
            request_start_key: header.key.clone(),
            request_end_key: header.end_key.clone(),
            range: None,
        })
    }

    // --- admin operations ------------------------------------------------

    async fn send_admin(&self, request: Request) -> Result<Response> {
        match request {
            Request::AdminSplit(req) => {
                self.admin_split(&req.header.key, req.split_key.clone()).await?;
                Ok(Response::AdminSplit(AdminSplitResponse {
                    header: ResponseHeader::default(),
                }))
            }
            Request::AdminMerge(req) => {
                self.admin_merge(&req.header.key).await?;
                Ok(Response::AdminMerge(AdminMergeResponse {
                    header: ResponseHeader::default(),
                }))
            }
            _ => Err(Error::internal("not an admin request")),
        }
    }

    fn db(&self) -> Result<Arc<dyn crate::dist::KvSender>> {
        self.db
            .read()
            .clone()
            .ok_or_else(|| Error::internal("store has no cluster sender"))
    }

    /// Allocate a fresh range id from the cluster-wide counter.
    async fn alloc_range_id(&self) -> Result<RangeId> {
        let db = self.db()?;
        let response = db
            .send(Request::Increment(crate::api::request::IncrementRequest {
                header: RequestHeader::point(RANGE_ID_GENERATOR_KEY.to_vec()),
                increment: 1,
            }))
            .await?;
        match response {
            Response::Increment(resp) => Ok(RangeId(resp.new_value as u64)),
            other => Err(Error::internal(format!(
                "unexpected response {:?} to id allocation",
                other.method()
            ))),
        }
    }

    /// Split the range containing `key` at `split_key` (or at the
    /// size-weighted midpoint when empty).
    pub async fn admin_split(&self, key: &[u8], split_key: Key) -> Result<RangeDescriptor> {
        let replica = self.resolve_replica(&RequestHeader::point(key.to_vec()))?;
        let desc = replica.descriptor();

        let split_key = if split_key.is_empty() {
            mvcc::find_split_key(self.engine.as_reader(), &desc.start_key, &desc.end_key)?
                .ok_or_else(|| Error::internal("range has no usable split point"))?
        } else {
            split_key
        };
        if !desc.contains_key(&split_key) || split_key == desc.start_key {
            return Err(Error::internal(format!(
                "split key {} outside ({}, {})",
                pretty_key(&split_key),
                pretty_key(&desc.start_key),
                pretty_key(&desc.end_key),
            )));
        }

        let new_range_id = self.alloc_range_id().await?;
        let mut updated_desc = desc.clone();
        updated_desc.end_key = split_key.clone();
        let new_desc = RangeDescriptor {
            range_id: new_range_id,
            start_key: split_key.clone(),
            end_key: desc.end_key.clone(),
            replicas: desc
                .replicas
                .iter()
                .enumerate()
                .map(|(i, r)| ReplicaDescriptor {
                    node_id: r.node_id,
                    store_id: r.store_id,
                    replica_id: ReplicaId(i as u32 + 1),
                })
                .collect(),
            next_replica_id: ReplicaId(desc.replicas.len() as u32 + 1),
        };

        info!(
            range_id = %desc.range_id,
            split_key = %pretty_key(&split_key),
            new_range = %new_range_id,
            "splitting range"
        );

        // Phase one: update the addressing index transactionally.
        self.write_addressing(&updated_desc, &new_desc).await?;

        // Phase two: apply the split to the range itself as a consensus
        // command, idempotent under re-proposal via the change token.
        let change_token: u64 = rand::random();
        replica
            .send(Request::InternalSplit(InternalSplitRequest {
                header: RequestHeader {
                    key: desc.start_key.clone(),
                    end_key: desc.end_key.clone(),
                    range_id: desc.range_id,
                    ..Default::default()
                },
                updated_desc,
                new_desc: new_desc.clone(),
                change_token,
            }))
            .await?;
        Ok(new_desc)
    }

    /// Merge the range containing `key` with its right-hand neighbor.
    pub async fn admin_merge(&self, key: &[u8]) -> Result<()> {
        let left = self.resolve_replica(&RequestHeader::point(key.to_vec()))?;
        let left_desc = left.descriptor();
        if left_desc.end_key.is_empty() {
            return Err(Error::internal("rightmost range has no merge partner"));
        }
        let right = self.resolve_replica(&RequestHeader::point(left_desc.end_key.clone()))?;
        let right_desc = right.descriptor();

        // Merging requires co-located replica sets; the replicate queue
        // converges them first.
        let mut left_stores: Vec<_> = left_desc.replicas.iter().map(|r| r.store_id).collect();
        let mut right_stores: Vec<_> = right_desc.replicas.iter().map(|r| r.store_id).collect();
        left_stores.sort();
        right_stores.sort();
        if left_stores != right_stores {
            return Err(Error::internal(format!(
                "cannot merge {} and {}: replica sets differ",
                left_desc, right_desc
            )));
        }

        let mut updated_desc = left_desc.clone();
        updated_desc.end_key = right_desc.end_key.clone();

        info!(left = %left_desc, right = %right_desc, "merging ranges");

        // Addressing: the record keyed at the old shared boundary goes
        // away, and the right range's record now maps to the merged one.
        let db = self.db()?;
        let clock = self.clock.clone();
        let heartbeat_nanos = self.heartbeat_timeout_nanos;
        let boundary_key = keys::range_addressing_key(&left_desc.end_key);
        let merged_key = keys::range_addressing_key(&updated_desc.end_key);
        let merged_value = Value::from_bytes(
            bincode::serialize(&updated_desc)
                .map_err(|e| Error::internal(format!("encode descriptor: {}", e)))?,
        );
        let meta1_key = updated_desc
            .contains_key(keys::META2_PREFIX)
            .then(|| {
                let mut k = keys::META1_PREFIX.to_vec();
                k.extend_from_slice(keys::KEY_MAX);
                k
            });
        txn::run_transaction(
            db,
            clock,
            heartbeat_nanos,
            txn::TxnOptions {
                name: "merge".to_string(),
                isolation: crate::api::data::Isolation::Serializable,
            },
            move |t: &mut txn::Txn| {
                let boundary_key = boundary_key.clone();
                let merged_key = merged_key.clone();
                let merged_value = merged_value.clone();
                let meta1_key = meta1_key.clone();
                Box::pin(async move {
                    t.delete(&boundary_key).await?;
                    t.put(&merged_key, merged_value.clone()).await?;
                    if let Some(meta1_key) = meta1_key {
                        t.put(&meta1_key, merged_value).await?;
                    }
                    Ok(())
                })
            },
        )
        .await?;

        let change_token: u64 = rand::random();
        left.send(Request::InternalMerge(InternalMergeRequest {
            header: RequestHeader {
                key: left_desc.start_key.clone(),
                end_key: right_desc.end_key.clone(),
                range_id: left_desc.range_id,
                ..Default::default()
            },
            updated_desc,
            subsumed_range_id: right_desc.range_id,
            change_token,
        }))
        .await?;
        Ok(())
    }

    async fn write_addressing(
        &self,
        updated_desc: &RangeDescriptor,
        new_desc: &RangeDescriptor,
    ) -> Result<()> {
        let db = self.db()?;
        let clock = self.clock.clone();
        let heartbeat_nanos = self.heartbeat_timeout_nanos;
        let left_key = keys::range_addressing_key(&updated_desc.end_key);
        let left_value = Value::from_bytes(
            bincode::serialize(updated_desc)
                .map_err(|e| Error::internal(format!("encode descriptor: {}", e)))?,
        );
        let right_key = keys::range_addressing_key(&new_desc.end_key);
        let right_value = Value::from_bytes(
            bincode::serialize(new_desc)
                .map_err(|e| Error::internal(format!("encode descriptor: {}", e)))?,
        );
        // When the left half still owns the addressing span, the meta1
        // entry must follow it.
        let meta1_key = updated_desc
            .contains_key(keys::META2_PREFIX)
            .then(|| {
                let mut k = keys::META1_PREFIX.to_vec();
                k.extend_from_slice(keys::KEY_MAX);
                k
            });
        txn::run_transaction(
            db,
            clock,
            heartbeat_nanos,
            txn::TxnOptions {
                name: "split".to_string(),
                isolation: crate::api::data::Isolation::Serializable,
            },
            move |t: &mut txn::Txn| {
                let left_key = left_key.clone();
                let left_value = left_value.clone();
                let right_key = right_key.clone();
                let right_value = right_value.clone();
                let meta1_key = meta1_key.clone();
                Box::pin(async move {
                    t.put(&left_key, left_value.clone()).await?;
                    t.put(&right_key, right_value).await?;
                    if let Some(meta1_key) = meta1_key {
                        t.put(&meta1_key, left_value).await?;
                    }
                    Ok(())
                })
            },
        )
        .await
    }

    /// Add or remove a replica of a range, updating the descriptor via
    /// consensus and seeding a new replica with a snapshot.
    pub async fn admin_change_replicas(
        &self,
        range_id: RangeId,
        change: ReplicaChange,
    ) -> Result<()> {
        let replica = self
            .replica(range_id)
            .ok_or(Error::RangeNotFound { range_id })?;
        let change_token: u64 = rand::random();
        let desc = replica.descriptor();
        replica
            .send(Request::InternalChangeReplicas(
                InternalChangeReplicasRequest {
                    header: RequestHeader {
                        key: desc.start_key.clone(),
                        end_key: desc.end_key.clone(),
                        range_id,
                        ..Default::default()
                    },
                    change: change.clone(),
                    change_token,
                },
            ))
            .await?;
        if let ReplicaChange::Add(new_replica) = change {
            // The new replica has no log to accept appends against; seed
            // it with a snapshot at the current applied state.
            replica.send_snapshot_to(new_replica)?;
        }
        Ok(())
    }

    /// Registered peer stores not currently holding a replica of `desc`.
    pub fn replication_targets(&self, desc: &RangeDescriptor) -> Vec<ReplicaDescriptor> {
        self.peer_stores
            .read()
            .iter()
            .filter(|p| desc.find_replica(p.store_id).is_none())
            .copied()
            .collect()
    }
}
