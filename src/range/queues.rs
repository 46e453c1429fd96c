//! Store background queues.
//!
//! Each queue is a periodic worker over the store's replicas, subscribed
//! to the stopper: split (and merge) by size policy, version garbage
//! collection, replication repair, dropping re-parented replicas, and
//! background stats verification. Queues act through the same admin and
//! consensus paths as client traffic, so everything they do is ordinary
//! replicated work.

use crate::api::data::ReplicaDescriptor;
use crate::api::request::{InternalGcRequest, ReplicaChange, Request, RequestHeader};
use crate::core::clock::Timestamp;
use crate::core::runtime::Stopper;
use crate::range::store::Store;
use crate::storage::mvcc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Scan intervals for the background queues.
#[derive(Debug, Clone)]
pub struct QueueIntervals {
    pub split: Duration,
    pub gc: Duration,
    pub replicate: Duration,
    pub range_gc: Duration,
    pub verify: Duration,
}

impl Default for QueueIntervals {
    fn default() -> Self {
        Self {
            split: Duration::from_secs(1),
            gc: Duration::from_secs(60),
            replicate: Duration::from_secs(5),
            range_gc: Duration::from_secs(10),
            verify: Duration::from_secs(30),
        }
    }
}

/// Spawn all background queues for `store`.
pub fn spawn_queues(store: &Arc<Store>, stopper: &Arc<Stopper>, intervals: QueueIntervals) {
    spawn_worker(store, stopper, "split-queue", intervals.split, split_scan);
    spawn_worker(store, stopper, "gc-queue", intervals.gc, gc_scan);
    spawn_worker(
        store,
        stopper,
        "replicate-queue",
        intervals.replicate,
        replicate_scan,
    );
    spawn_worker(store, stopper, "range-gc-queue", intervals.range_gc, range_gc_scan);
    spawn_worker(store, stopper, "verify-queue", intervals.verify, verify_scan);
}

fn spawn_worker<F, Fut>(
    store: &Arc<Store>,
    stopper: &Arc<Stopper>,
    name: &str,
    interval: Duration,
    scan: F,
) where
    F: Fn(Arc<Store>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let store = Arc::clone(store);
    let mut shutdown = stopper.shutdown_signal();
    let task_name = format!("{}-{}", name, store.store_id());
    stopper.spawn(task_name, async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            scan(Arc::clone(&store)).await;
        }
    });
}

/// Split overweight ranges; merge adjacent underweight neighbors.
pub async fn split_scan(store: Arc<Store>) {
    let zone = store.zone_config();
    let mut replicas = store.replicas();
    replicas.sort_by_key(|r| r.descriptor().start_key);

    for replica in &replicas {
        if !replica.raft().is_leader() {
            continue;
        }
        let stats = replica.stats();
        if stats.total_bytes() > zone.range_max_bytes {
            let desc = replica.descriptor();
            info!(range_id = %desc.range_id, bytes = stats.total_bytes(), "range over size threshold, splitting");
            if let Err(e) = store.admin_split(&desc.start_key, Vec::new()).await {
                debug!(range_id = %desc.range_id, error = %e, "split attempt failed");
            }
        }
    }

    for pair in replicas.windows(2) {
        let (left, right) = (&pair[0], &pair[1]);
        let left_desc = left.descriptor();
        let right_desc = right.descriptor();
        if left_desc.end_key != right_desc.start_key || !left.raft().is_leader() {
            continue;
        }
        let combined = left.stats().total_bytes() + right.stats().total_bytes();
        if combined < zone.range_min_bytes {
            info!(left = %left_desc.range_id, right = %right_desc.range_id, "adjacent ranges under size threshold, merging");
            if let Err(e) = store.admin_merge(&left_desc.start_key).await {
                debug!(range_id = %left_desc.range_id, error = %e, "merge attempt failed");
            }
        }
    }
}

/// Propose version garbage collection below the configured TTL.
pub async fn gc_scan(store: Arc<Store>) {
    let zone = store.zone_config();
    let now = store.clock().now();
    let ttl_nanos = zone.gc_ttl_seconds.saturating_mul(1_000_000_000);
    if now.wall_time <= ttl_nanos {
        return;
    }
    let threshold = Timestamp::new(now.wall_time - ttl_nanos, 0);

    for replica in store.replicas() {
        if !replica.raft().is_leader() {
            continue;
        }
        let desc = replica.descriptor();
        let request = Request::InternalGc(InternalGcRequest {
            header: RequestHeader {
                key: desc.start_key.clone(),
                end_key: desc.end_key.clone(),
                range_id: desc.range_id,
                ..Default::default()
            },
            gc_threshold: threshold,
        });
        if let Err(e) = replica.send(request).await {
            debug!(range_id = %desc.range_id, error = %e, "gc attempt failed");
        }
    }
}

/// Repair under-replicated ranges using registered peer stores.
pub async fn replicate_scan(store: Arc<Store>) {
    let zone = store.zone_config();
    for replica in store.replicas() {
        if !replica.raft().is_leader() {
            continue;
        }
        let desc = replica.descriptor();
        if desc.replicas.len() >= zone.replication_factor as usize {
            continue;
        }
        let Some(target) = store.replication_targets(&desc).into_iter().next() else {
            warn!(range_id = %desc.range_id, "under-replicated range has no repair target");
            continue;
        };
        let new_replica = ReplicaDescriptor {
            node_id: target.node_id,
            store_id: target.store_id,
            replica_id: desc.next_replica_id,
        };
        info!(range_id = %desc.range_id, target = %new_replica, "repairing under-replicated range");
        if let Err(e) = store
            .admin_change_replicas(desc.range_id, ReplicaChange::Add(new_replica))
            .await
        {
            debug!(range_id = %desc.range_id, error = %e, "replica addition failed");
        }
    }
}

/// Drop replicas of ranges this store no longer belongs to.
pub async fn range_gc_scan(store: Arc<Store>) {
    for replica in store.replicas() {
        let desc = replica.descriptor();
        if desc.find_replica(store.store_id()).is_none() {
            info!(range_id = %desc.range_id, "dropping re-parented replica");
            if let Err(e) = store.remove_replica(desc.range_id) {
                warn!(range_id = %desc.range_id, error = %e, "replica removal failed");
            }
        }
    }
}

/// Verify that incrementally maintained stats match a fresh computation.
pub async fn verify_scan(store: Arc<Store>) {
    for replica in store.replicas() {
        let desc = replica.descriptor();
        let stored = replica.stats();
        let computed = match mvcc::compute_stats(
            store.engine().as_reader(),
            &desc.start_key,
            &desc.end_key,
            stored.last_update_nanos,
        ) {
            Ok(stats) => stats,
            Err(e) => {
                warn!(range_id = %desc.range_id, error = %e, "stats verification scan failed");
                continue;
            }
        };
        let consistent = stored.key_bytes == computed.key_bytes
            && stored.val_bytes == computed.val_bytes
            && stored.live_bytes == computed.live_bytes
            && stored.intent_bytes == computed.intent_bytes
            && stored.key_count == computed.key_count
            && stored.val_count == computed.val_count
            && stored.live_count == computed.live_count
            && stored.intent_count == computed.intent_count;
        if !consistent {
            error!(
                range_id = %desc.range_id,
                ?stored,
                ?computed,
                "range stats diverged from recomputation"
            );
        }
    }
}
