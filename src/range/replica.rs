//! Per-range replica: the consensus-backed command pipeline.
//!
//! Commands flow receive → command-queue enqueue → timestamp-cache check →
//! propose → wait for commit → apply → reply → command-queue release.
//! Reads are served by the leaseholder from the local engine without a
//! consensus round; writes are proposed as log entries and applied by
//! every replica in log order.
//!
//! The apply loop is the only writer to the engine for its range. It
//! records the applied index and the updated range stats in the same
//! atomic batch as each command's effects, making replays after restart
//! no-ops. An engine write failure during apply is fatal to the replica:
//! it marks itself dead and reports through the store event channel.

use crate::api::data::{
    Key, MvccStats, RangeDescriptor, RangeId, ReplicaDescriptor, StoreId, Transaction, TxnStatus,
};
use crate::api::request::{
    BatchResponse, ConditionalPutResponse, DeleteRangeResponse, DeleteResponse,
    EndTransactionResponse, GetResponse, IncrementResponse, InternalChangeReplicasResponse,
    InternalGcResponse, InternalHeartbeatTxnResponse, InternalLeaderLeaseResponse,
    InternalMergeResponse, InternalPushTxnRequest, InternalPushTxnResponse,
    InternalRangeLookupResponse, InternalResolveIntentResponse, InternalSplitResponse,
    InternalTruncateLogResponse, PushTxnType, PutResponse, ReplicaChange, Request, Response,
    ResponseHeader, ReverseScanResponse, ScanResponse,
};
use crate::core::clock::{Clock, Timestamp};
use crate::core::error::{Error, Result};
use crate::range::command_queue::CommandQueue;
use crate::range::lease::Lease;
use crate::range::raft::{LogEntry, RaftEvent, RaftGroup, RangeSnapshot};
use crate::range::ts_cache::TimestampCache;
use crate::storage::engine::{Engine, EngineReader, WriteBatch};
use crate::storage::keys;
use crate::storage::mvcc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

/// How long a leader lease lasts from its start timestamp.
pub const DEFAULT_LEASE_DURATION_NANOS: i64 = 1_000_000_000;

/// A command carried through the consensus log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RangeCommand {
    /// Per-proposal identifier matching the proposer's pending table.
    cmd_id: u64,
    request: Request,
}

/// Notifications from a replica to its owning store.
#[derive(Debug)]
pub enum StoreEvent {
    /// A split applied locally; the store must materialize the new range.
    SplitApplied {
        parent: RangeId,
        new_desc: RangeDescriptor,
    },
    /// A merge applied locally; the store must drop the subsumed range.
    MergeApplied {
        parent: RangeId,
        subsumed: RangeId,
    },
    /// The replica set changed; addressing caches may be stale.
    ReplicasChanged { range_id: RangeId },
    /// The replica hit an unrecoverable storage fault and stopped.
    ReplicaDead { range_id: RangeId, message: String },
}

/// One replica of a range, resident on one store.
pub struct Replica {
    range_id: RangeId,
    store_id: StoreId,
    this: ReplicaDescriptor,
    desc: RwLock<RangeDescriptor>,
    engine: Arc<dyn Engine>,
    clock: Arc<Clock>,
    raft: Arc<RaftGroup>,

    cmd_q: Mutex<CommandQueue>,
    ts_cache: Mutex<TimestampCache>,
    stats: Mutex<MvccStats>,
    lease: RwLock<Option<Lease>>,

    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Response>>>>,
    dead: AtomicBool,

    /// Pushers abort transactions whose record has not been heartbeat
    /// within this window.
    heartbeat_timeout_nanos: i64,

    store_events: mpsc::UnboundedSender<StoreEvent>,
}

impl Replica {
    /// Construct a replica for `desc` on `store_id`, recovering persisted
    /// state from the engine. Returns the replica and the raft event
    /// stream the caller must service via [`Replica::run_apply`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        desc: RangeDescriptor,
        this: ReplicaDescriptor,
        engine: Arc<dyn Engine>,
        clock: Arc<Clock>,
        transport: Arc<dyn crate::range::raft::RaftTransport>,
        heartbeat_timeout_nanos: i64,
        store_events: mpsc::UnboundedSender<StoreEvent>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<RaftEvent>)> {
        let range_id = desc.range_id;
        let applied = read_applied_index(engine.as_reader(), range_id)?;
        let (raft, events_rx) = RaftGroup::new(
            range_id,
            this,
            desc.replicas.clone(),
            engine.clone(),
            transport,
            applied,
        )?;

        let stats: MvccStats = engine
            .get(&keys::range_stats_key(range_id))?
            .map(|raw| bincode::deserialize(&raw))
            .transpose()
            .map_err(|e| Error::internal(format!("decode stats: {}", e)))?
            .unwrap_or_default();

        let lease: Option<Lease> = engine
            .get(&keys::range_lease_key(range_id))?
            .map(|raw| bincode::deserialize(&raw))
            .transpose()
            .map_err(|e| Error::internal(format!("decode lease: {}", e)))?;

        let now = clock.now();
        let replica = Arc::new(Self {
            range_id,
            store_id: this.store_id,
            this,
            desc: RwLock::new(desc),
            engine,
            clock,
            raft: Arc::new(raft),
            cmd_q: Mutex::new(CommandQueue::new()),
            ts_cache: Mutex::new(TimestampCache::new(now)),
            stats: Mutex::new(stats),
            lease: RwLock::new(lease),
            pending: Mutex::new(HashMap::new()),
            dead: AtomicBool::new(false),
            heartbeat_timeout_nanos,
            store_events,
        });
        Ok((replica, events_rx))
    }

    pub fn range_id(&self) -> RangeId {
        self.range_id
    }

    /// A copy of the current descriptor.
    pub fn descriptor(&self) -> RangeDescriptor {
        self.desc.read().clone()
    }

    /// Current range stats.
    pub fn stats(&self) -> MvccStats {
        *self.stats.lock()
    }

    /// The consensus group handle.
    pub fn raft(&self) -> &Arc<RaftGroup> {
        &self.raft
    }

    /// Whether the replica has stopped after a storage fault.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Campaign for consensus leadership of this range.
    pub fn campaign(&self) -> Result<()> {
        self.raft.campaign()
    }

    /// The last applied log index.
    pub fn applied_index(&self) -> Result<u64> {
        read_applied_index(self.engine.as_reader(), self.range_id)
    }

    /// Execute one request through the command pipeline.
    pub async fn send(&self, mut request: Request) -> Result<Response> {
        if self.is_dead() {
            return Err(Error::NodeUnavailable);
        }

        let read_only = request.is_read_only();
        let now = self.clock.now();

        // Finalize the operation timestamp: transactional requests run at
        // the transaction's timestamp, others at the clock reading unless
        // the client picked one.
        {
            let h = request.header_mut();
            if let Some(txn) = &h.txn {
                h.timestamp = txn.timestamp;
            } else if h.timestamp.is_zero() {
                h.timestamp = now;
            }
        }

        let (start, end) = request_span(&request);

        // Serialize with conflicting commands, then hold our own slot for
        // the duration of execution.
        let (barrier, handle) = {
            let mut cq = self.cmd_q.lock();
            let barrier = cq.get_wait(&start, &end, read_only);
            let handle = cq.add(&start, &end, read_only);
            (barrier, handle)
        };
        barrier.wait().await;

        let result = self.execute_after_queue(request, &start, &end, read_only, now).await;

        self.cmd_q.lock().remove(handle);
        result
    }

    async fn execute_after_queue(
        &self,
        mut request: Request,
        start: &[u8],
        end: &[u8],
        read_only: bool,
        now: Timestamp,
    ) -> Result<Response> {
        // Leases gate both reads and proposals. Lease requests themselves
        // go straight to consensus.
        if !matches!(request, Request::InternalLeaderLease(_)) {
            self.ensure_lease(now).await?;
        }

        if read_only {
            let response = self.execute_read(&request)?;
            self.ts_cache
                .lock()
                .add(start, end, request.header().timestamp, true);
            return Ok(response);
        }

        // Writers move past the highest read (and write low-water)
        // timestamp recorded for their span.
        {
            let cache = self.ts_cache.lock();
            let h = request.header_mut();
            let mut ts = h.timestamp;
            let max_read = cache.get_max(start, end, true);
            if max_read >= ts {
                ts = max_read.next();
            }
            let max_write = cache.get_max(start, end, false);
            if max_write >= ts {
                ts = max_write.next();
            }
            h.timestamp = ts;
            if let Some(txn) = &mut h.txn {
                txn.timestamp.forward(ts);
            }
        }

        let write_ts = request.header().timestamp;
        let result = self.propose_and_wait(request).await;
        if result.is_ok() {
            self.ts_cache.lock().add(start, end, write_ts, false);
        }
        result
    }

    /// Acquire or validate the leader lease covering `now`.
    async fn ensure_lease(&self, now: Timestamp) -> Result<()> {
        let existing = self.lease.read().clone();
        match existing {
            Some(lease) if lease.covers(now) => {
                if lease.owned_by(self.store_id) {
                    Ok(())
                } else {
                    Err(Error::NotLeader {
                        replica: Some(self.this),
                        leader: Some(lease.replica),
                    })
                }
            }
            _ => {
                // No valid lease: request one for ourselves. Only the
                // consensus leader can propose, which keeps lease
                // acquisition from racing across replicas.
                if !self.raft.is_leader() {
                    return Err(Error::NotLeader {
                        replica: Some(self.this),
                        leader: self.raft.leader(),
                    });
                }
                let lease = Lease {
                    start: now,
                    expiration: now.add_nanos(DEFAULT_LEASE_DURATION_NANOS),
                    replica: self.this,
                };
                let request = Request::InternalLeaderLease(
                    crate::api::request::InternalLeaderLeaseRequest {
                        header: crate::api::request::RequestHeader {
                            key: self.desc.read().start_key.clone(),
                            timestamp: now,
                            range_id: self.range_id,
                            ..Default::default()
                        },
                        lease,
                    },
                );
                match self.propose_and_wait(request).await {
                    Ok(_) => Ok(()),
                    // A concurrent request may have won the lease race;
                    // what matters is who holds it now.
                    Err(Error::LeaseRejected { existing }) => {
                        let lease = self.lease.read().clone();
                        match lease {
                            Some(l) if l.covers(now) && l.owned_by(self.store_id) => Ok(()),
                            Some(l) if l.covers(now) => Err(Error::NotLeader {
                                replica: Some(self.this),
                                leader: Some(l.replica),
                            }),
                            _ => Err(Error::LeaseRejected { existing }),
                        }
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn propose_and_wait(&self, request: Request) -> Result<Response> {
        let cmd_id: u64 = rand::random();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(cmd_id, tx);

        let command = RangeCommand { cmd_id, request };
        let encoded = bincode::serialize(&command)
            .map_err(|e| Error::internal(format!("encode command: {}", e)))?;
        if let Err(e) = self.raft.propose(encoded) {
            self.pending.lock().remove(&cmd_id);
            return Err(e);
        }
        rx.await
            .map_err(|_| Error::internal("proposal abandoned"))?
    }

    // --- read path -------------------------------------------------------

    fn execute_read(&self, request: &Request) -> Result<Response> {
        let snapshot = self.engine.snapshot();
        let mut stats = MvccStats::default();
        let mut scratch = WriteBatch::new();
        let response =
            self.execute_request(request, snapshot.as_ref(), &mut scratch, &mut stats)?;
        debug_assert!(scratch.is_empty(), "read produced engine writes");
        Ok(response)
    }

    // --- apply path ------------------------------------------------------

    /// Service the raft event stream until shutdown. Must be spawned once
    /// per replica; it is the only engine writer for the range.
    pub async fn run_apply(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<RaftEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                RaftEvent::Committed(entries) => {
                    for entry in entries {
                        if let Err(e) = self.apply_entry(&entry) {
                            self.mark_dead(e);
                            return;
                        }
                    }
                }
                RaftEvent::SnapshotNeeded(to) => {
                    if let Err(e) = self.send_snapshot_to(to) {
                        warn!(range_id = %self.range_id, error = %e, "snapshot generation failed");
                    }
                }
                RaftEvent::InstallSnapshot(snapshot) => {
                    if let Err(e) = self.install_snapshot(snapshot) {
                        self.mark_dead(e);
                        return;
                    }
                }
                RaftEvent::Reproposal(commands) => self.repropose(commands),
            }
        }
    }

    /// Stop the replica after an unrecoverable storage fault observed
    /// outside the apply loop (e.g. a failed log append).
    pub fn fatal(&self, err: Error) {
        self.mark_dead(err);
    }

    fn mark_dead(&self, err: Error) {
        error!(range_id = %self.range_id, error = %err, "replica stopping after storage fault");
        self.dead.store(true, Ordering::Release);
        // Waiters must not hang on a dead replica.
        let mut pending = self.pending.lock();
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(Error::NodeUnavailable));
        }
        self.cmd_q.lock().clear();
        let _ = self.store_events.send(StoreEvent::ReplicaDead {
            range_id: self.range_id,
            message: err.to_string(),
        });
    }

    /// Apply one committed entry exactly once.
    fn apply_entry(&self, entry: &LogEntry) -> Result<()> {
        let applied = read_applied_index(self.engine.as_reader(), self.range_id)?;
        if entry.index <= applied {
            // Replay after restart; the effects are already durable.
            return Ok(());
        }

        let command: RangeCommand = bincode::deserialize(&entry.command)
            .map_err(|e| Error::internal(format!("decode command: {}", e)))?;

        let mut batch = WriteBatch::new();
        let mut stats = *self.stats.lock();
        let result =
            self.execute_request(&command.request, self.engine.as_reader(), &mut batch, &mut stats);

        // A failed command still consumes its log slot: the applied index
        // advances and the command's staged effects are dropped.
        if result.is_err() {
            batch = WriteBatch::new();
            stats = *self.stats.lock();
        }

        batch.put(
            keys::range_applied_index_key(self.range_id),
            bincode::serialize(&entry.index)
                .map_err(|e| Error::internal(format!("encode applied index: {}", e)))?,
        );
        batch.put(
            keys::range_stats_key(self.range_id),
            bincode::serialize(&stats)
                .map_err(|e| Error::internal(format!("encode stats: {}", e)))?,
        );
        self.engine.write(batch)?;
        *self.stats.lock() = stats;

        if let Some(tx) = self.pending.lock().remove(&command.cmd_id) {
            let _ = tx.send(result);
        }
        Ok(())
    }

    fn repropose(&self, commands: Vec<Vec<u8>>) {
        for encoded in commands {
            match self.raft.propose(encoded.clone()) {
                Ok(_) => debug!(range_id = %self.range_id, "re-proposed command after leader change"),
                Err(e) => {
                    // We are no longer leader; fail the waiter so the
                    // sender retries against the new one.
                    if let Ok(command) = bincode::deserialize::<RangeCommand>(&encoded) {
                        if let Some(tx) = self.pending.lock().remove(&command.cmd_id) {
                            let _ = tx.send(Err(e.clone()));
                        }
                    }
                }
            }
        }
    }

    /// Assemble and send a catch-up snapshot to a follower. Also invoked
    /// directly after a replica addition, before the new replica has any
    /// log to accept appends against.
    pub fn send_snapshot_to(&self, to: ReplicaDescriptor) -> Result<()> {
        let (last_index, last_term) = self.raft.snapshot_meta();
        let pairs = self.collect_snapshot_pairs()?;
        self.raft.send_snapshot(
            to,
            RangeSnapshot {
                range_id: self.range_id,
                last_index,
                last_term,
                pairs,
            },
        );
        Ok(())
    }

    fn collect_snapshot_pairs(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let desc = self.desc.read().clone();
        let snapshot = self.engine.snapshot();
        let mut pairs = Vec::new();

        // Range-local bookkeeping, minus the log itself (the snapshot
        // replaces it) and minus hard state (owned by the group).
        let local_prefix = {
            let mut p = keys::LOCAL_PREFIX.to_vec();
            p.extend_from_slice(&self.range_id.0.to_be_bytes());
            p
        };
        let log_prefix = keys::range_log_prefix(self.range_id);
        let hard_key = keys::range_hard_state_key(self.range_id);
        for (k, v) in snapshot.scan(&local_prefix, &keys::prefix_end(&local_prefix), 0)? {
            if k.starts_with(&log_prefix) || k == hard_key {
                continue;
            }
            pairs.push((k, v));
        }

        // The data span.
        let start = keys::mvcc_encode_meta_key(&desc.start_key);
        let end = if desc.end_key.is_empty() {
            keys::mvcc_encode_meta_key(keys::KEY_MAX)
        } else {
            keys::mvcc_encode_meta_key(&desc.end_key)
        };
        pairs.extend(snapshot.scan(&start, &end, 0)?);
        Ok(pairs)
    }

    fn install_snapshot(&self, snapshot: RangeSnapshot) -> Result<()> {
        debug!(range_id = %self.range_id, last_index = snapshot.last_index, "installing snapshot");
        let desc = self.desc.read().clone();
        let mut batch = WriteBatch::new();

        // Clear our current contents for the span before laying down the
        // leader's records.
        let start = keys::mvcc_encode_meta_key(&desc.start_key);
        let end = if desc.end_key.is_empty() {
            keys::mvcc_encode_meta_key(keys::KEY_MAX)
        } else {
            keys::mvcc_encode_meta_key(&desc.end_key)
        };
        for (k, _) in self.engine.scan(&start, &end, 0)? {
            batch.delete(k);
        }
        for (k, v) in snapshot.pairs {
            batch.put(k, v);
        }
        batch.put(
            keys::range_applied_index_key(self.range_id),
            bincode::serialize(&snapshot.last_index)
                .map_err(|e| Error::internal(format!("encode applied index: {}", e)))?,
        );
        self.engine.write(batch)?;

        // Refresh in-memory state from the installed records.
        if let Some(raw) = self.engine.get(&keys::range_descriptor_key(self.range_id))? {
            let new_desc: RangeDescriptor = bincode::deserialize(&raw)
                .map_err(|e| Error::internal(format!("decode descriptor: {}", e)))?;
            self.raft.set_peers(new_desc.replicas.clone());
            *self.desc.write() = new_desc;
        }
        if let Some(raw) = self.engine.get(&keys::range_stats_key(self.range_id))? {
            *self.stats.lock() = bincode::deserialize(&raw)
                .map_err(|e| Error::internal(format!("decode stats: {}", e)))?;
        }
        if let Some(raw) = self.engine.get(&keys::range_lease_key(self.range_id))? {
            *self.lease.write() = Some(
                bincode::deserialize(&raw)
                    .map_err(|e| Error::internal(format!("decode lease: {}", e)))?,
            );
        }
        Ok(())
    }

    // --- command execution ----------------------------------------------

    /// Execute a request against `base` + `batch`, folding stats deltas
    /// into `stats`. Deterministic: every replica produces identical
    /// effects for identical input.
    fn execute_request(
        &self,
        request: &Request,
        base: &dyn EngineReader,
        batch: &mut WriteBatch,
        stats: &mut MvccStats,
    ) -> Result<Response> {
        let h = request.header();
        let ts = h.timestamp;
        let txn = h.txn.as_ref();
        let now_nanos = ts.wall_time;

        let mut response = match request {
            Request::Get(req) => {
                let overlay = batch.overlay(base);
                let value = mvcc::get(&overlay, &req.header.key, ts, txn)?;
                Response::Get(GetResponse {
                    header: ResponseHeader::default(),
                    value,
                })
            }
            Request::Scan(req) => {
                let overlay = batch.overlay(base);
                let rows = mvcc::scan(
                    &overlay,
                    &req.header.key,
                    &req.header.end_key,
                    ts,
                    req.max_results as usize,
                    false,
                    txn,
                )?;
                Response::Scan(ScanResponse {
                    header: ResponseHeader::default(),
                    rows,
                })
            }
            Request::ReverseScan(req) => {
                let overlay = batch.overlay(base);
                let rows = mvcc::scan(
                    &overlay,
                    &req.header.key,
                    &req.header.end_key,
                    ts,
                    req.max_results as usize,
                    true,
                    txn,
                )?;
                Response::ReverseScan(ReverseScanResponse {
                    header: ResponseHeader::default(),
                    rows,
                })
            }
            Request::Put(req) => {
                self.checked_write(ts, txn, || {
                    mvcc::put(
                        base,
                        batch,
                        stats,
                        &req.header.key,
                        ts,
                        req.value.clone(),
                        txn,
                        now_nanos,
                    )
                })?;
                Response::Put(PutResponse::default())
            }
            Request::ConditionalPut(req) => {
                self.checked_write(ts, txn, || {
                    mvcc::conditional_put(
                        base,
                        batch,
                        stats,
                        &req.header.key,
                        ts,
                        req.value.clone(),
                        req.expected.as_ref(),
                        txn,
                        now_nanos,
                    )
                })?;
                Response::ConditionalPut(ConditionalPutResponse::default())
            }
            Request::Increment(req) => {
                let new_value = self.checked_write(ts, txn, || {
                    mvcc::increment(
                        base,
                        batch,
                        stats,
                        &req.header.key,
                        ts,
                        req.increment,
                        txn,
                        now_nanos,
                    )
                })?;
                Response::Increment(IncrementResponse {
                    header: ResponseHeader::default(),
                    new_value,
                })
            }
            Request::Delete(req) => {
                self.checked_write(ts, txn, || {
                    mvcc::delete(base, batch, stats, &req.header.key, ts, txn, now_nanos)
                })?;
                Response::Delete(DeleteResponse::default())
            }
            Request::DeleteRange(req) => {
                let num_deleted = self.checked_write(ts, txn, || {
                    mvcc::delete_range(
                        base,
                        batch,
                        stats,
                        &req.header.key,
                        &req.header.end_key,
                        ts,
                        req.max_entries_to_delete as usize,
                        txn,
                        now_nanos,
                    )
                })?;
                Response::DeleteRange(DeleteRangeResponse {
                    header: ResponseHeader::default(),
                    num_deleted,
                })
            }
            Request::Batch(req) => {
                let mut responses = Vec::with_capacity(req.requests.len());
                for sub in &req.requests {
                    // Sub-requests inherit the batch's timestamp and
                    // transaction.
                    let mut sub = sub.clone();
                    let sh = sub.header_mut();
                    sh.timestamp = ts;
                    sh.txn = h.txn.clone();
                    responses.push(self.execute_request(&sub, base, batch, stats)?);
                }
                Response::Batch(BatchResponse {
                    header: ResponseHeader::default(),
                    responses,
                })
            }
            Request::EndTransaction(req) => {
                self.execute_end_transaction(req, base, batch, stats, now_nanos)?
            }
            Request::InternalHeartbeatTxn(req) => {
                let req_txn = req.header.txn.as_ref().ok_or(Error::OpRequiresTxn)?;
                let record_key = keys::transaction_key(req_txn.id);
                let existing: Option<Transaction> = {
                    let overlay = batch.overlay(base);
                    mvcc::get_record(&overlay, &record_key)?
                };
                let mut record = existing.unwrap_or_else(|| req_txn.clone());
                match record.status {
                    TxnStatus::Aborted => {
                        return Err(Error::TransactionAborted {
                            txn: Box::new(record),
                        })
                    }
                    TxnStatus::Committed => {
                        return Err(Error::TransactionStatus {
                            txn: Box::new(record),
                            msg: "heartbeat on committed transaction".to_string(),
                        })
                    }
                    TxnStatus::Pending => {}
                }
                // The heartbeat carries its own wall reading; the
                // transaction timestamp says nothing about liveness.
                record.last_heartbeat = Some(req.now);
                mvcc::put_record(base, batch, stats, &record_key, &record, now_nanos)?;
                Response::InternalHeartbeatTxn(InternalHeartbeatTxnResponse {
                    header: ResponseHeader {
                        txn: Some(record),
                        ..Default::default()
                    },
                })
            }
            Request::InternalPushTxn(req) => {
                self.execute_push_txn(req, base, batch, stats, now_nanos)?
            }
            Request::InternalResolveIntent(req) => {
                if req.header.end_key.is_empty() {
                    mvcc::resolve_intent(
                        base,
                        batch,
                        stats,
                        &req.header.key,
                        &req.intent_txn,
                        now_nanos,
                    )?;
                } else {
                    mvcc::resolve_intent_range(
                        base,
                        batch,
                        stats,
                        &req.header.key,
                        &req.header.end_key,
                        &req.intent_txn,
                        0,
                        now_nanos,
                    )?;
                }
                Response::InternalResolveIntent(InternalResolveIntentResponse::default())
            }
            Request::InternalGc(req) => {
                mvcc::garbage_collect(
                    base,
                    batch,
                    stats,
                    &req.header.key,
                    &req.header.end_key,
                    req.gc_threshold,
                    now_nanos,
                )?;
                Response::InternalGc(InternalGcResponse::default())
            }
            Request::InternalRangeLookup(req) => {
                let overlay = batch.overlay(base);
                let lookup_start = keys::next_key(&req.header.key);
                let max = req.max_ranges.max(1) as usize;
                let rows = mvcc::scan(
                    &overlay,
                    &lookup_start,
                    keys::META_MAX,
                    Timestamp::max(),
                    max,
                    false,
                    None,
                )?;
                let mut ranges = Vec::with_capacity(rows.len());
                for kv in rows {
                    let raw = kv
                        .value
                        .bytes
                        .ok_or_else(|| Error::internal("addressing record without bytes"))?;
                    let desc: RangeDescriptor = bincode::deserialize(&raw)
                        .map_err(|e| Error::internal(format!("decode descriptor: {}", e)))?;
                    ranges.push(desc);
                }
                Response::InternalRangeLookup(InternalRangeLookupResponse {
                    header: ResponseHeader::default(),
                    ranges,
                })
            }
            Request::InternalTruncateLog(req) => {
                self.raft.truncate_log(req.index)?;
                Response::InternalTruncateLog(InternalTruncateLogResponse::default())
            }
            Request::InternalLeaderLease(req) => {
                let existing = self.lease.read().clone();
                if let Some(current) = &existing {
                    if current.covers(ts) && current.replica != req.lease.replica {
                        return Err(Error::LeaseRejected {
                            existing: Some(current.replica),
                        });
                    }
                }
                batch.put(
                    keys::range_lease_key(self.range_id),
                    bincode::serialize(&req.lease)
                        .map_err(|e| Error::internal(format!("encode lease: {}", e)))?,
                );
                let previous_holder = existing.map(|l| l.replica);
                *self.lease.write() = Some(req.lease.clone());
                // A new holder cannot know what the old one served; its
                // timestamp cache restarts at the lease start.
                if previous_holder != Some(req.lease.replica)
                    && req.lease.owned_by(self.store_id)
                {
                    self.ts_cache.lock().clear(req.lease.start);
                }
                Response::InternalLeaderLease(InternalLeaderLeaseResponse::default())
            }
            Request::InternalChangeReplicas(req) => {
                if self.change_token_applied(base, batch, req.change_token)? {
                    return Ok(Response::InternalChangeReplicas(
                        InternalChangeReplicasResponse::default(),
                    ));
                }
                let mut desc = self.desc.read().clone();
                match &req.change {
                    ReplicaChange::Add(replica) => {
                        if desc.find_replica(replica.store_id).is_none() {
                            desc.replicas.push(*replica);
                            if replica.replica_id >= desc.next_replica_id {
                                desc.next_replica_id =
                                    crate::api::data::ReplicaId(replica.replica_id.0 + 1);
                            }
                        }
                    }
                    ReplicaChange::Remove(replica) => {
                        desc.replicas.retain(|r| r.replica_id != replica.replica_id);
                    }
                }
                self.write_descriptor(batch, &desc, req.change_token)?;
                self.raft.set_peers(desc.replicas.clone());
                *self.desc.write() = desc;
                let _ = self.store_events.send(StoreEvent::ReplicasChanged {
                    range_id: self.range_id,
                });
                Response::InternalChangeReplicas(InternalChangeReplicasResponse::default())
            }
            Request::InternalSplit(req) => {
                if self.change_token_applied(base, batch, req.change_token)? {
                    return Ok(Response::InternalSplit(InternalSplitResponse::default()));
                }
                self.execute_split(req, batch, now_nanos)?;
                Response::InternalSplit(InternalSplitResponse::default())
            }
            Request::InternalMerge(req) => {
                if self.change_token_applied(base, batch, req.change_token)? {
                    return Ok(Response::InternalMerge(InternalMergeResponse::default()));
                }
                self.execute_merge(req, batch, now_nanos)?;
                Response::InternalMerge(InternalMergeResponse::default())
            }
            Request::AdminSplit(_) | Request::AdminMerge(_) => {
                return Err(Error::internal(
                    "admin requests are orchestrated by the store",
                ))
            }
        };

        let rh = response.header_mut();
        rh.timestamp = ts;
        if rh.txn.is_none() {
            rh.txn = h.txn.clone();
        }
        Ok(response)
    }

    /// Run a write op, converting `WriteTooOld` for transactional writers
    /// into an immediate-restart retry at a bumped timestamp.
    fn checked_write<T>(
        &self,
        _ts: Timestamp,
        txn: Option<&Transaction>,
        op: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        match op() {
            Err(Error::WriteTooOld {
                existing_timestamp, ..
            }) if txn.is_some() => {
                let mut restarted = txn.unwrap().clone();
                restarted.timestamp.forward(existing_timestamp.next());
                Err(Error::TransactionRetry {
                    txn: Box::new(restarted),
                })
            }
            other => other,
        }
    }

    fn execute_end_transaction(
        &self,
        req: &crate::api::request::EndTransactionRequest,
        base: &dyn EngineReader,
        batch: &mut WriteBatch,
        stats: &mut MvccStats,
        now_nanos: i64,
    ) -> Result<Response> {
        let req_txn = req.header.txn.as_ref().ok_or(Error::OpRequiresTxn)?;
        let record_key = keys::transaction_key(req_txn.id);
        let existing: Option<Transaction> = {
            let overlay = batch.overlay(base);
            mvcc::get_record(&overlay, &record_key)?
        };

        let mut record = existing.unwrap_or_else(|| req_txn.clone());
        match record.status {
            TxnStatus::Committed => {
                return Err(Error::TransactionStatus {
                    txn: Box::new(record),
                    msg: "transaction already committed".to_string(),
                })
            }
            TxnStatus::Aborted => {
                return Err(Error::TransactionAborted {
                    txn: Box::new(record),
                })
            }
            TxnStatus::Pending => {}
        }
        if req_txn.epoch < record.epoch {
            let record_epoch = record.epoch;
            return Err(Error::TransactionStatus {
                txn: Box::new(record),
                msg: format!(
                    "end transaction from stale epoch {} < {}",
                    req_txn.epoch, record_epoch
                ),
            });
        }

        // Fold in the coordinator's view: pushed timestamps recorded on
        // the record by pushers, and vice versa.
        record.epoch = req_txn.epoch;
        record.timestamp.forward(req_txn.timestamp);
        record.orig_timestamp.forward(req_txn.orig_timestamp);
        record.upgrade_priority(req_txn.priority);

        if req.commit {
            // A serializable transaction whose commit timestamp moved off
            // its read snapshot must restart; there is no read set to
            // prove the reads still hold.
            if record.isolation == crate::api::data::Isolation::Serializable
                && record.timestamp != record.orig_timestamp
            {
                return Err(Error::TransactionRetry {
                    txn: Box::new(record),
                });
            }
            record.status = TxnStatus::Committed;
        } else {
            record.status = TxnStatus::Aborted;
        }

        mvcc::put_record(base, batch, stats, &record_key, &record, now_nanos)?;
        Ok(Response::EndTransaction(EndTransactionResponse {
            header: ResponseHeader {
                txn: Some(record),
                ..Default::default()
            },
            commit_wait: 0,
        }))
    }

    fn execute_push_txn(
        &self,
        req: &InternalPushTxnRequest,
        base: &dyn EngineReader,
        batch: &mut WriteBatch,
        stats: &mut MvccStats,
        now_nanos: i64,
    ) -> Result<Response> {
        let record_key = keys::transaction_key(req.pushee_txn.id);
        let existing: Option<Transaction> = {
            let overlay = batch.overlay(base);
            mvcc::get_record(&overlay, &record_key)?
        };

        let pusher = req.header.txn.as_ref();
        let pusher_priority = pusher
            .map(|t| t.priority)
            .or(req.header.user_priority)
            .unwrap_or(1);
        let pusher_ts = pusher
            .map(|t| t.timestamp)
            .unwrap_or(req.header.timestamp);

        let mut pushee = match existing {
            Some(record) => record,
            None => {
                // No record: the pushee wrote intents but its begin never
                // landed (or was garbage collected). The push wins.
                let mut p = req.pushee_txn.clone();
                p.status = TxnStatus::Aborted;
                mvcc::put_record(base, batch, stats, &record_key, &p, now_nanos)?;
                return Ok(Response::InternalPushTxn(InternalPushTxnResponse {
                    header: ResponseHeader::default(),
                    pushee_txn: Some(p),
                }));
            }
        };

        if pushee.status.is_terminal() {
            // Already decided; the pusher resolves accordingly.
            return Ok(Response::InternalPushTxn(InternalPushTxnResponse {
                header: ResponseHeader::default(),
                pushee_txn: Some(pushee),
            }));
        }

        let last_active = pushee
            .last_heartbeat
            .unwrap_or(pushee.orig_timestamp)
            .wall_time;
        let expired = req.now.wall_time - last_active >= self.heartbeat_timeout_nanos;

        // Priorities were drawn with a random component at transaction
        // start, so equal-priority conflicts do not deterministically
        // livelock; exact ties fall to the earlier timestamp, then to the
        // pushee.
        let pusher_wins = expired
            || pusher_priority > pushee.priority
            || (pusher_priority == pushee.priority && pusher_ts < pushee.orig_timestamp);

        if !pusher_wins {
            return Err(Error::TransactionPush {
                txn: pusher.cloned().map(Box::new),
                pushee_txn: Box::new(pushee),
            });
        }

        match req.push_type {
            PushTxnType::Timestamp if pushee.isolation == crate::api::data::Isolation::Snapshot => {
                pushee.timestamp.forward(pusher_ts.next());
            }
            _ => {
                pushee.status = TxnStatus::Aborted;
            }
        }
        mvcc::put_record(base, batch, stats, &record_key, &pushee, now_nanos)?;
        Ok(Response::InternalPushTxn(InternalPushTxnResponse {
            header: ResponseHeader::default(),
            pushee_txn: Some(pushee),
        }))
    }

    fn change_token_applied(
        &self,
        base: &dyn EngineReader,
        batch: &WriteBatch,
        token: u64,
    ) -> Result<bool> {
        let key = keys::range_change_token_key(self.range_id, token);
        Ok(batch.overlay(base).get(&key)?.is_some())
    }

    fn write_descriptor(
        &self,
        batch: &mut WriteBatch,
        desc: &RangeDescriptor,
        token: u64,
    ) -> Result<()> {
        batch.put(
            keys::range_descriptor_key(desc.range_id),
            bincode::serialize(desc)
                .map_err(|e| Error::internal(format!("encode descriptor: {}", e)))?,
        );
        batch.put(keys::range_change_token_key(self.range_id, token), vec![1]);
        Ok(())
    }

    fn execute_split(
        &self,
        req: &crate::api::request::InternalSplitRequest,
        batch: &mut WriteBatch,
        now_nanos: i64,
    ) -> Result<()> {
        let desc = self.desc.read().clone();
        if req.updated_desc.range_id != desc.range_id
            || req.updated_desc.start_key != desc.start_key
            || req.new_desc.end_key != desc.end_key
        {
            return Err(Error::internal(format!(
                "split descriptors do not cover {}",
                desc
            )));
        }

        // Recompute stats for both halves from the engine; the deltas of
        // a running range cannot be split analytically.
        let left_stats = mvcc::compute_stats(
            self.engine.as_reader(),
            &req.updated_desc.start_key,
            &req.updated_desc.end_key,
            now_nanos,
        )?;
        let right_stats = mvcc::compute_stats(
            self.engine.as_reader(),
            &req.new_desc.start_key,
            &req.new_desc.end_key,
            now_nanos,
        )?;

        self.write_descriptor(batch, &req.updated_desc, req.change_token)?;
        batch.put(
            keys::range_descriptor_key(req.new_desc.range_id),
            bincode::serialize(&req.new_desc)
                .map_err(|e| Error::internal(format!("encode descriptor: {}", e)))?,
        );
        batch.put(
            keys::range_stats_key(desc.range_id),
            bincode::serialize(&left_stats)
                .map_err(|e| Error::internal(format!("encode stats: {}", e)))?,
        );
        batch.put(
            keys::range_stats_key(req.new_desc.range_id),
            bincode::serialize(&right_stats)
                .map_err(|e| Error::internal(format!("encode stats: {}", e)))?,
        );
        batch.put(
            keys::range_applied_index_key(req.new_desc.range_id),
            bincode::serialize(&0u64)
                .map_err(|e| Error::internal(format!("encode applied index: {}", e)))?,
        );

        *self.desc.write() = req.updated_desc.clone();
        *self.stats.lock() = left_stats;
        let _ = self.store_events.send(StoreEvent::SplitApplied {
            parent: desc.range_id,
            new_desc: req.new_desc.clone(),
        });
        debug!(
            range_id = %desc.range_id,
            new_range = %req.new_desc.range_id,
            split_key = %crate::api::data::pretty_key(&req.new_desc.start_key),
            "applied split"
        );
        Ok(())
    }

    fn execute_merge(
        &self,
        req: &crate::api::request::InternalMergeRequest,
        batch: &mut WriteBatch,
        now_nanos: i64,
    ) -> Result<()> {
        let desc = self.desc.read().clone();
        if req.updated_desc.range_id != desc.range_id
            || req.updated_desc.start_key != desc.start_key
        {
            return Err(Error::internal(format!(
                "merge descriptor does not extend {}",
                desc
            )));
        }

        let merged_stats = mvcc::compute_stats(
            self.engine.as_reader(),
            &req.updated_desc.start_key,
            &req.updated_desc.end_key,
            now_nanos,
        )?;

        self.write_descriptor(batch, &req.updated_desc, req.change_token)?;
        batch.put(
            keys::range_stats_key(desc.range_id),
            bincode::serialize(&merged_stats)
                .map_err(|e| Error::internal(format!("encode stats: {}", e)))?,
        );
        // The subsumed range's bookkeeping goes away.
        batch.delete(keys::range_descriptor_key(req.subsumed_range_id));
        batch.delete(keys::range_stats_key(req.subsumed_range_id));
        batch.delete(keys::range_applied_index_key(req.subsumed_range_id));

        *self.desc.write() = req.updated_desc.clone();
        *self.stats.lock() = merged_stats;
        let _ = self.store_events.send(StoreEvent::MergeApplied {
            parent: desc.range_id,
            subsumed: req.subsumed_range_id,
        });
        debug!(range_id = %desc.range_id, subsumed = %req.subsumed_range_id, "applied merge");
        Ok(())
    }
}

/// The span a request occupies in the command queue.
fn request_span(request: &Request) -> (Key, Key) {
    if let Request::Batch(batch) = request {
        let mut start: Option<Key> = None;
        let mut end: Option<Key> = None;
        for sub in &batch.requests {
            let (s, e) = request_span(sub);
            if start.as_ref().map(|cur| s < *cur).unwrap_or(true) {
                start = Some(s.clone());
            }
            let sub_end = if e.is_empty() { keys::next_key(&s) } else { e };
            if end.as_ref().map(|cur| sub_end > *cur).unwrap_or(true) {
                end = Some(sub_end);
            }
        }
        return (start.unwrap_or_default(), end.unwrap_or_default());
    }
    let h = request.header();
    (h.key.clone(), h.end_key.clone())
}

fn read_applied_index(reader: &dyn EngineReader, range_id: RangeId) -> Result<u64> {
    match reader.get(&keys::range_applied_index_key(range_id))? {
        Some(raw) => bincode::deserialize(&raw)
            .map_err(|e| Error::internal(format!("decode applied index: {}", e))),
        None => Ok(0),
    }
}
