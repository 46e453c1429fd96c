//! Range descriptor cache.
//!
//! Descriptors are indexed by their end key, mirroring the addressing
//! index layout: the covering range for a key is the first entry whose
//! end key sorts above it. The map is copy-on-write behind an `Arc`:
//! readers clone the handle and never block; the single writer swaps in a
//! rebuilt map.

use crate::api::data::{Key, RangeDescriptor};
use crate::storage::keys;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

type DescMap = BTreeMap<Key, RangeDescriptor>;

/// Shared, read-mostly cache of range descriptors.
#[derive(Default)]
pub struct RangeDescriptorCache {
    map: RwLock<Arc<DescMap>>,
}

fn end_key_index(desc: &RangeDescriptor) -> Key {
    if desc.end_key.is_empty() {
        keys::KEY_MAX.to_vec()
    } else {
        desc.end_key.clone()
    }
}

impl RangeDescriptorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached descriptor covering `key`, if any.
    pub fn lookup(&self, key: &[u8]) -> Option<RangeDescriptor> {
        let map = Arc::clone(&self.map.read());
        let (_, desc) = map
            .range::<Key, _>((Bound::Excluded(key.to_vec()), Bound::Unbounded))
            .next()?;
        desc.contains_key(key).then(|| desc.clone())
    }

    /// Insert (or replace) a descriptor.
    pub fn insert(&self, desc: RangeDescriptor) {
        let mut guard = self.map.write();
        let mut next = (**guard).clone();
        // A descriptor split or merged since we last saw it leaves stale
        // overlapping entries; drop anything intersecting the new span.
        let start = desc.start_key.clone();
        let end = end_key_index(&desc);
        next.retain(|idx_end, old| {
            let old_start = &old.start_key;
            !(idx_end > &start && *old_start < end)
        });
        next.insert(end, desc);
        *guard = Arc::new(next);
    }

    /// Drop the entry covering `key`, typically after a routing miss.
    pub fn evict(&self, key: &[u8]) {
        let mut guard = self.map.write();
        let covering: Option<Key> = guard
            .range::<Key, _>((Bound::Excluded(key.to_vec()), Bound::Unbounded))
            .next()
            .filter(|(_, d)| d.contains_key(key))
            .map(|(k, _)| k.clone());
        if let Some(index_key) = covering {
            let mut next = (**guard).clone();
            next.remove(&index_key);
            *guard = Arc::new(next);
        }
    }

    /// Number of cached descriptors.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}
