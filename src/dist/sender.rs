//! The distributed sender.
//!
//! Client-side router: resolves each request's key span to a range
//! descriptor (through the two-level addressing index, cached), picks the
//! leaseholder replica, and submits. Routing errors refresh the cache and
//! retry with bounded backoff; conflicting intents trigger a push against
//! the owning transaction before the retry. Cross-range batches are split
//! per range and submitted in parallel.

use crate::api::data::{Intent, RangeDescriptor, RangeId, StoreId};
use crate::api::request::{
    BatchRequest, BatchResponse, InternalPushTxnRequest, InternalRangeLookupRequest,
    InternalResolveIntentRequest, PushTxnType, Request, RequestHeader, Response, ResponseHeader,
};
use crate::core::clock::Clock;
use crate::core::error::{Error, Result};
use crate::core::retry::{Backoff, RetryOptions};
use crate::dist::range_cache::RangeDescriptorCache;
use crate::dist::{KvSender, SendFuture};
use crate::range::store::Store;
use crate::storage::keys;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Cap on per-request routing retries.
const MAX_SEND_ATTEMPTS: usize = 64;

struct Inner {
    stores: RwLock<HashMap<StoreId, Arc<Store>>>,
    cache: RangeDescriptorCache,
    leaseholder_hints: RwLock<HashMap<RangeId, StoreId>>,
    clock: Arc<Clock>,
    retry_opts: RetryOptions,
}

/// Router from typed requests to the stores owning their ranges. Cheap to
/// clone; clones share routing state.
#[derive(Clone)]
pub struct DistSender {
    inner: Arc<Inner>,
}

impl DistSender {
    pub fn new(clock: Arc<Clock>, retry_opts: RetryOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                stores: RwLock::new(HashMap::new()),
                cache: RangeDescriptorCache::new(),
                leaseholder_hints: RwLock::new(HashMap::new()),
                clock,
                retry_opts,
            }),
        }
    }

    /// Register a reachable store.
    pub fn add_store(&self, store: Arc<Store>) {
        self.inner.stores.write().insert(store.store_id(), store);
    }

    /// Seed the descriptor cache with the first range, learned out of
    /// band at connect time.
    pub fn seed(&self, desc: RangeDescriptor) {
        self.inner.cache.insert(desc);
    }

    /// Route a request, retrying through routing and conflict errors.
    pub async fn submit(&self, request: Request) -> Result<Response> {
        if let Request::Batch(batch) = request {
            return self.submit_batch(batch).await;
        }
        if request.is_ranged() {
            return self.submit_ranged(request).await;
        }
        self.submit_one(request).await
    }

    /// Split a span-addressed request along range boundaries and stitch
    /// the per-range results back together.
    async fn submit_ranged(&self, request: Request) -> Result<Response> {
        let (start, end) = {
            let h = request.header();
            (h.key.clone(), h.end_key.clone())
        };

        // Walk the covering descriptors to build the chunk list.
        let mut chunks: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut cursor = start;
        loop {
            let desc = self.lookup_descriptor(&cursor).await?;
            let desc_end = desc.end_key.clone();
            let chunk_end = if desc_end.is_empty() {
                end.clone()
            } else if end.is_empty() || desc_end < end {
                desc_end.clone()
            } else {
                end.clone()
            };
            chunks.push((cursor.clone(), chunk_end));
            let covered = desc_end.is_empty() || (!end.is_empty() && desc_end >= end);
            if covered {
                break;
            }
            cursor = desc_end;
        }

        let reverse = matches!(request, Request::ReverseScan(_));
        if reverse {
            chunks.reverse();
        }
        let limit = match &request {
            Request::Scan(r) => r.max_results,
            Request::ReverseScan(r) => r.max_results,
            Request::DeleteRange(r) => r.max_entries_to_delete,
            _ => 0,
        };

        let mut rows = Vec::new();
        let mut num_deleted = 0u64;
        let mut merged_header = ResponseHeader::default();
        for (chunk_start, chunk_end) in chunks {
            let mut piece = request.clone();
            {
                let h = piece.header_mut();
                h.key = chunk_start;
                h.end_key = chunk_end;
                h.range_id = RangeId(0);
                h.replica = None;
            }
            let collected = rows.len() as u64 + num_deleted;
            if limit != 0 {
                let remaining = limit - collected;
                match &mut piece {
                    Request::Scan(r) => r.max_results = remaining,
                    Request::ReverseScan(r) => r.max_results = remaining,
                    Request::DeleteRange(r) => r.max_entries_to_delete = remaining,
                    _ => {}
                }
            }

            let response = Box::pin(self.submit_one(piece)).await?;
            merged_header = response.header().clone();
            match response {
                Response::Scan(r) => rows.extend(r.rows),
                Response::ReverseScan(r) => rows.extend(r.rows),
                Response::DeleteRange(r) => num_deleted += r.num_deleted,
                Response::InternalResolveIntent(_) => {}
                other => {
                    return Err(Error::internal(format!(
                        "unexpected response kind {} for span piece",
                        other.method()
                    )))
                }
            }
            if limit != 0 && rows.len() as u64 + num_deleted >= limit {
                break;
            }
        }

        Ok(match &request {
            Request::Scan(_) => Response::Scan(crate::api::request::ScanResponse {
                header: merged_header,
                rows,
            }),
            Request::ReverseScan(_) => {
                Response::ReverseScan(crate::api::request::ReverseScanResponse {
                    header: merged_header,
                    rows,
                })
            }
            Request::DeleteRange(_) => {
                Response::DeleteRange(crate::api::request::DeleteRangeResponse {
                    header: merged_header,
                    num_deleted,
                })
            }
            _ => Response::InternalResolveIntent(
                crate::api::request::InternalResolveIntentResponse {
                    header: merged_header,
                },
            ),
        })
    }

    async fn submit_one(&self, mut request: Request) -> Result<Response> {
        let mut backoff = Backoff::new(self.inner.retry_opts.clone());
        loop {
            let key = request.header().key.clone();
            let desc = self.lookup_descriptor(&key).await?;

            // Prefer the replica last seen holding the lease.
            let hint = self
                .inner
                .leaseholder_hints
                .read()
                .get(&desc.range_id)
                .copied();
            let replica = hint
                .and_then(|store_id| desc.find_replica(store_id).copied())
                .or_else(|| desc.replicas.first().copied())
                .ok_or_else(|| Error::internal(format!("{} has no replicas", desc)))?;

            let store = self.inner.stores.read().get(&replica.store_id).cloned();
            let Some(store) = store else {
                return Err(Error::NodeUnavailable);
            };

            {
                let h = request.header_mut();
                h.range_id = desc.range_id;
                h.replica = Some(replica);
            }

            let err = match store.send(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };
            trace!(error = %err, method = %request.method(), "send attempt failed");

            match &err {
                Error::NotLeader { leader, .. } => {
                    let mut hints = self.inner.leaseholder_hints.write();
                    match leader {
                        Some(leader) => {
                            hints.insert(desc.range_id, leader.store_id);
                        }
                        None => {
                            hints.remove(&desc.range_id);
                        }
                    }
                }
                Error::RangeKeyMismatch { range, .. } => {
                    self.inner.cache.evict(&key);
                    if let Some(correct) = range {
                        self.inner.cache.insert(correct.clone());
                    }
                }
                Error::RangeNotFound { .. } => {
                    self.inner.cache.evict(&key);
                    self.inner.leaseholder_hints.write().remove(&desc.range_id);
                }
                Error::NodeUnavailable => {}
                Error::WriteIntent { intents, resolved } if !resolved => {
                    // Conflict with another transaction's provisional
                    // write: push it, resolve, then retry.
                    if let Err(push_err) = self.push_intents(&mut request, intents.clone()).await {
                        match (&push_err, request.header().txn.is_some()) {
                            // A non-transactional request that lost the
                            // push waits out the winner and tries again.
                            (Error::TransactionPush { .. }, false) => {}
                            _ => return Err(push_err),
                        }
                    }
                }
                _ => return Err(err),
            }
            if !err.is_retryable() && !matches!(&err, Error::WriteIntent { .. }) {
                return Err(err);
            }

            // Routing retries are bounded even under an unbounded policy;
            // a span that keeps mismatching (e.g. split mid-flight) goes
            // back to the caller for re-planning.
            if backoff.attempts() >= MAX_SEND_ATTEMPTS {
                return Err(err);
            }
            match backoff.next_backoff() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return Err(err),
            }
        }
    }

    /// Split a batch by owning range and submit the pieces in parallel,
    /// reassembling responses in request order.
    async fn submit_batch(&self, batch: BatchRequest) -> Result<Response> {
        // Group sub-requests by covering range.
        let mut groups: Vec<(RangeId, BatchRequest, Vec<usize>)> = Vec::new();
        for (position, sub) in batch.requests.iter().enumerate() {
            let mut sub = sub.clone();
            {
                let sh = sub.header_mut();
                if sh.txn.is_none() {
                    sh.txn = batch.header.txn.clone();
                }
            }
            let desc = self.lookup_descriptor(&sub.header().key).await?;
            match groups.iter_mut().find(|(rid, _, _)| *rid == desc.range_id) {
                Some((_, group, positions)) => {
                    group.requests.push(sub);
                    positions.push(position);
                }
                None => {
                    let mut header = batch.header.clone();
                    header.key = desc.start_key.clone();
                    header.end_key = desc.end_key.clone();
                    header.range_id = RangeId(0);
                    groups.push((
                        desc.range_id,
                        BatchRequest {
                            header,
                            requests: vec![sub],
                        },
                        vec![position],
                    ));
                }
            }
        }

        debug!(groups = groups.len(), "submitting batch");
        let mut tasks = tokio::task::JoinSet::new();
        for (_, group, positions) in groups {
            let sender = self.clone();
            tasks.spawn(async move {
                let response = sender.submit_one(Request::Batch(group)).await;
                (positions, response)
            });
        }

        let mut responses: Vec<Option<Response>> = vec![None; batch.requests.len()];
        while let Some(joined) = tasks.join_next().await {
            let (positions, response) =
                joined.map_err(|e| Error::internal(format!("batch task failed: {}", e)))?;
            match response? {
                Response::Batch(group_resp) => {
                    for (position, resp) in positions.into_iter().zip(group_resp.responses) {
                        responses[position] = Some(resp);
                    }
                }
                other => {
                    return Err(Error::internal(format!(
                        "unexpected response kind {} for batch piece",
                        other.method()
                    )))
                }
            }
        }

        Ok(Response::Batch(BatchResponse {
            header: ResponseHeader::default(),
            responses: responses
                .into_iter()
                .map(|r| r.ok_or_else(|| Error::internal("batch piece missing")))
                .collect::<Result<Vec<_>>>()?,
        }))
    }

    /// Resolve the descriptor covering `key`, consulting the addressing
    /// index on a cache miss.
    async fn lookup_descriptor(&self, key: &[u8]) -> Result<RangeDescriptor> {
        if let Some(desc) = self.inner.cache.lookup(key) {
            return Ok(desc);
        }
        let meta_key = keys::range_meta_key(key);
        if meta_key == keys::KEY_MIN {
            return Err(Error::internal(
                "descriptor cache missing the first range; sender was not seeded",
            ));
        }

        let lookup = Request::InternalRangeLookup(InternalRangeLookupRequest {
            header: RequestHeader::point(meta_key),
            max_ranges: 8,
        });
        // Recursive route: the lookup itself is a read on the meta range.
        let response = Box::pin(self.submit_one(lookup)).await?;
        let Response::InternalRangeLookup(resp) = response else {
            return Err(Error::internal("unexpected response to range lookup"));
        };
        let mut covering = None;
        for desc in resp.ranges {
            if desc.contains_key(key) {
                covering = Some(desc.clone());
            }
            self.inner.cache.insert(desc);
        }
        covering.ok_or_else(|| Error::RangeKeyMismatch {
            request_start_key: key.to_vec(),
            request_end_key: vec![],
            range: None,
        })
    }

    /// Push the transactions owning `intents` out of the way, resolving
    /// their intents on success, so the original request can proceed.
    async fn push_intents(&self, request: &mut Request, intents: Vec<Intent>) -> Result<()> {
        let push_type = if request.is_read_only() {
            // Readers only need the writer above their read timestamp.
            PushTxnType::Timestamp
        } else {
            PushTxnType::Abort
        };
        let now = self.inner.clock.now();

        for intent in intents {
            let mut header = RequestHeader::point(keys::transaction_key(intent.txn.id));
            header.txn = request.header().txn.clone();
            header.timestamp = request.header().timestamp;
            if header.txn.is_none() {
                // Non-transactional pushers carry an explicit priority so
                // the push decision is deterministic on every replica.
                header.user_priority = Some(
                    request
                        .header()
                        .user_priority
                        .unwrap_or_else(|| crate::api::data::make_priority(None)),
                );
            }

            let push = Request::InternalPushTxn(InternalPushTxnRequest {
                header,
                pushee_txn: intent.txn.clone(),
                push_type,
                now,
            });
            let response = Box::pin(self.submit_one(push)).await?;
            let Response::InternalPushTxn(resp) = response else {
                return Err(Error::internal("unexpected response to push"));
            };
            let Some(pushee) = resp.pushee_txn else {
                return Err(Error::internal("push returned no pushee"));
            };

            // Aborting a competitor ratchets our own priority so chains
            // of mutual aborts cannot livelock.
            if pushee.status == crate::api::data::TxnStatus::Aborted {
                if let Some(txn) = &mut request.header_mut().txn {
                    txn.upgrade_priority(pushee.priority - 1);
                }
            }

            let resolve = Request::InternalResolveIntent(InternalResolveIntentRequest {
                header: RequestHeader {
                    key: intent.key.clone(),
                    end_key: intent.end_key.clone(),
                    ..Default::default()
                },
                intent_txn: pushee,
            });
            Box::pin(self.submit_one(resolve)).await?;
        }
        Ok(())
    }
}

impl KvSender for DistSender {
    fn send(&self, request: Request) -> SendFuture<'_> {
        Box::pin(self.submit(request))
    }
}
