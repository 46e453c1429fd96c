//! Ordered key/value engine abstraction.
//!
//! The MVCC layer sits on any engine providing ordered iteration,
//! consistent snapshots, and atomic write batches. Production would back
//! this with a log-structured merge tree; the in-memory implementation
//! here provides identical semantics for a single process and for tests.

use crate::api::data::Key;
use crate::core::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An atomic group of writes. All operations land together or not at all.
///
/// Staged entries are last-wins per key (`Some` = put, `None` = delete),
/// and [`WriteBatch::overlay`] exposes them merged over a base reader so
/// a multi-operation command observes its own pending writes.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    entries: BTreeMap<Key, Option<Vec<u8>>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a put.
    pub fn put(&mut self, key: impl Into<Key>, value: Vec<u8>) {
        self.entries.insert(key.into(), Some(value));
    }

    /// Stage a deletion.
    pub fn delete(&mut self, key: impl Into<Key>) {
        self.entries.insert(key.into(), None);
    }

    /// Number of staged keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the batch carries no operations.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A read view of `base` with this batch's staged writes applied.
    pub fn overlay<'a>(&'a self, base: &'a dyn EngineReader) -> BatchReader<'a> {
        BatchReader { batch: self, base }
    }
}

/// Read-through view over a base reader plus a pending batch.
pub struct BatchReader<'a> {
    batch: &'a WriteBatch,
    base: &'a dyn EngineReader,
}

impl BatchReader<'_> {
    fn merge(
        &self,
        base_kvs: Vec<(Key, Vec<u8>)>,
        start: &[u8],
        end: &[u8],
        max: usize,
        reverse: bool,
    ) -> Vec<(Key, Vec<u8>)> {
        // Merge the two sorted sources; staged entries win over base ones.
        let mut merged: BTreeMap<Key, Option<Vec<u8>>> = base_kvs
            .into_iter()
            .map(|(k, v)| (k, Some(v)))
            .collect();
        for (k, v) in self.batch.entries.range(range_bounds(start, end)) {
            merged.insert(k.clone(), v.clone());
        }
        let live = merged.into_iter().filter_map(|(k, v)| v.map(|v| (k, v)));
        let mut out: Vec<(Key, Vec<u8>)> = if reverse {
            let mut v: Vec<_> = live.collect();
            v.reverse();
            v
        } else {
            live.collect()
        };
        if max != 0 && out.len() > max {
            out.truncate(max);
        }
        out
    }
}

impl EngineReader for BatchReader<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(staged) = self.batch.entries.get(key) {
            return Ok(staged.clone());
        }
        self.base.get(key)
    }

    fn scan(&self, start: &[u8], end: &[u8], max: usize) -> Result<Vec<(Key, Vec<u8>)>> {
        // The base scan cannot be bounded by `max` before merging:
        // staged deletions may knock out base entries.
        let base_kvs = self.base.scan(start, end, 0)?;
        Ok(self.merge(base_kvs, start, end, max, false))
    }

    fn reverse_scan(&self, start: &[u8], end: &[u8], max: usize) -> Result<Vec<(Key, Vec<u8>)>> {
        let base_kvs = self.base.scan(start, end, 0)?;
        Ok(self.merge(base_kvs, start, end, max, true))
    }
}

/// Read-only view over engine contents.
pub trait EngineReader: Send + Sync {
    /// Point lookup.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Ordered scan of `[start, end)`, at most `max` entries (0 =
    /// unbounded). An empty `end` means "to the end of the engine".
    fn scan(&self, start: &[u8], end: &[u8], max: usize) -> Result<Vec<(Key, Vec<u8>)>>;

    /// Reverse-ordered scan of `[start, end)`.
    fn reverse_scan(&self, start: &[u8], end: &[u8], max: usize) -> Result<Vec<(Key, Vec<u8>)>>;
}

/// An ordered key/value engine.
pub trait Engine: EngineReader {
    /// Apply a batch atomically.
    fn write(&self, batch: WriteBatch) -> Result<()>;

    /// This engine as a plain reader.
    fn as_reader(&self) -> &dyn EngineReader;

    /// Single put.
    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key.to_vec(), value);
        self.write(batch)
    }

    /// Single delete.
    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key.to_vec());
        self.write(batch)
    }

    /// A consistent point-in-time view, unaffected by later writes.
    fn snapshot(&self) -> Box<dyn EngineReader>;
}

fn range_bounds(start: &[u8], end: &[u8]) -> (Bound<Key>, Bound<Key>) {
    let lower = Bound::Included(start.to_vec());
    let upper = if end.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Excluded(end.to_vec())
    };
    (lower, upper)
}

fn scan_map(
    map: &BTreeMap<Key, Vec<u8>>,
    start: &[u8],
    end: &[u8],
    max: usize,
) -> Vec<(Key, Vec<u8>)> {
    let iter = map.range(range_bounds(start, end)).map(|(k, v)| (k.clone(), v.clone()));
    if max == 0 {
        iter.collect()
    } else {
        iter.take(max).collect()
    }
}

fn reverse_scan_map(
    map: &BTreeMap<Key, Vec<u8>>,
    start: &[u8],
    end: &[u8],
    max: usize,
) -> Vec<(Key, Vec<u8>)> {
    let iter = map
        .range(range_bounds(start, end))
        .rev()
        .map(|(k, v)| (k.clone(), v.clone()));
    if max == 0 {
        iter.collect()
    } else {
        iter.take(max).collect()
    }
}

/// In-memory ordered engine over a BTree map.
#[derive(Default)]
pub struct MemEngine {
    map: RwLock<BTreeMap<Key, Vec<u8>>>,

    /// Fault injection: when set, every write fails. Lets tests exercise
    /// the fatal-storage-error path on applying replicas.
    fail_writes: AtomicBool,
}

impl MemEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Toggle write-failure injection.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of physical records in the engine.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }
}

impl EngineReader for MemEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn scan(&self, start: &[u8], end: &[u8], max: usize) -> Result<Vec<(Key, Vec<u8>)>> {
        Ok(scan_map(&self.map.read(), start, end, max))
    }

    fn reverse_scan(&self, start: &[u8], end: &[u8], max: usize) -> Result<Vec<(Key, Vec<u8>)>> {
        Ok(reverse_scan_map(&self.map.read(), start, end, max))
    }
}

impl Engine for MemEngine {
    fn write(&self, batch: WriteBatch) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::internal("engine: injected write failure"));
        }
        let mut map = self.map.write();
        for (key, entry) in batch.entries {
            match entry {
                Some(value) => {
                    map.insert(key, value);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn as_reader(&self) -> &dyn EngineReader {
        self
    }

    fn snapshot(&self) -> Box<dyn EngineReader> {
        Box::new(MemSnapshot {
            map: self.map.read().clone(),
        })
    }
}

/// Frozen copy of the engine contents at snapshot time.
struct MemSnapshot {
    map: BTreeMap<Key, Vec<u8>>,
}

impl EngineReader for MemSnapshot {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.get(key).cloned())
    }

    fn scan(&self, start: &[u8], end: &[u8], max: usize) -> Result<Vec<(Key, Vec<u8>)>> {
        Ok(scan_map(&self.map, start, end, max))
    }

    fn reverse_scan(&self, start: &[u8], end: &[u8], max: usize) -> Result<Vec<(Key, Vec<u8>)>> {
        Ok(reverse_scan_map(&self.map, start, end, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_is_atomic_and_ordered() {
        let engine = MemEngine::new();
        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"b".to_vec(), b"2".to_vec());
        batch.delete(b"a".to_vec());
        engine.write(batch).unwrap();
        assert_eq!(engine.get(b"a").unwrap(), None);
        assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn scan_bounds() {
        let engine = MemEngine::new();
        for k in [b"a", b"b", b"c", b"d"] {
            engine.put(k, k.to_vec()).unwrap();
        }
        let kvs = engine.scan(b"b", b"d", 0).unwrap();
        assert_eq!(
            kvs.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![b"b".to_vec(), b"c".to_vec()]
        );
        let kvs = engine.scan(b"a", b"", 2).unwrap();
        assert_eq!(kvs.len(), 2);
        let kvs = engine.reverse_scan(b"a", b"", 0).unwrap();
        assert_eq!(kvs.first().unwrap().0, b"d".to_vec());
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let engine = MemEngine::new();
        engine.put(b"k", b"old".to_vec()).unwrap();
        let snap = engine.snapshot();
        engine.put(b"k", b"new".to_vec()).unwrap();
        assert_eq!(snap.get(b"k").unwrap(), Some(b"old".to_vec()));
        assert_eq!(engine.get(b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn overlay_reads_through_pending_writes() {
        let engine = MemEngine::new();
        engine.put(b"a", b"base-a".to_vec()).unwrap();
        engine.put(b"b", b"base-b".to_vec()).unwrap();

        let mut batch = WriteBatch::new();
        batch.put(b"b".to_vec(), b"staged-b".to_vec());
        batch.put(b"c".to_vec(), b"staged-c".to_vec());
        batch.delete(b"a".to_vec());

        let overlay = batch.overlay(engine.as_ref());
        assert_eq!(overlay.get(b"a").unwrap(), None);
        assert_eq!(overlay.get(b"b").unwrap(), Some(b"staged-b".to_vec()));
        let kvs = overlay.scan(b"", b"", 0).unwrap();
        assert_eq!(
            kvs,
            vec![
                (b"b".to_vec(), b"staged-b".to_vec()),
                (b"c".to_vec(), b"staged-c".to_vec()),
            ]
        );
        // The engine itself is untouched until the batch commits.
        assert_eq!(engine.get(b"a").unwrap(), Some(b"base-a".to_vec()));
    }

    #[test]
    fn injected_write_failure() {
        let engine = MemEngine::new();
        engine.set_fail_writes(true);
        assert!(engine.put(b"k", vec![1]).is_err());
    }
}
