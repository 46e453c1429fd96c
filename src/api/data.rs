//! Core wire and storage value types.
//!
//! Everything here is a plain serde value: descriptors are copied on read
//! and never hold back-references, per the ownership rules (stores own
//! replicas; integer ids stand in for any back-edge).

use crate::core::clock::Timestamp;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// An opaque byte-string key, ordered lexicographically.
pub type Key = Vec<u8>;

/// Render a key for logs and errors.
pub fn pretty_key(key: &[u8]) -> String {
    if key.is_empty() {
        return "/Min".to_string();
    }
    key.iter()
        .map(|&b| {
            if b.is_ascii_graphic() {
                (b as char).to_string()
            } else {
                format!("\\x{:02x}", b)
            }
        })
        .collect()
}

/// Seed for value checksums and transaction record placement.
const XXHASH_SEED: u64 = 0;

/// A value: opaque bytes or an integer, with an optional checksum.
///
/// The checksum covers the owning key and the contents, so a value read
/// back under the wrong key fails verification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    /// Raw byte contents, if this is a byte value.
    pub bytes: Option<Vec<u8>>,

    /// Integer contents, if this value carries counter semantics.
    pub integer: Option<i64>,

    /// Checksum of key + contents.
    pub checksum: Option<u64>,
}

impl Value {
    /// A byte value.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Some(bytes),
            integer: None,
            checksum: None,
        }
    }

    /// An integer value.
    pub fn from_integer(integer: i64) -> Self {
        Self {
            bytes: None,
            integer: Some(integer),
            checksum: None,
        }
    }

    /// Whether the value holds neither bytes nor an integer.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_none() && self.integer.is_none()
    }

    /// Approximate encoded size of the contents.
    pub fn len(&self) -> usize {
        self.bytes.as_ref().map(|b| b.len()).unwrap_or(0)
            + self.integer.map(|_| 8).unwrap_or(0)
    }

    /// Compute and store the checksum for this value under `key`.
    pub fn init_checksum(&mut self, key: &[u8]) {
        self.checksum = Some(self.compute_checksum(key));
    }

    /// Verify the stored checksum, if any.
    pub fn verify_checksum(&self, key: &[u8]) -> Result<(), String> {
        if let Some(sum) = self.checksum {
            let computed = self.compute_checksum(key);
            if sum != computed {
                return Err(format!(
                    "invalid checksum ({:x}) for key {}, value {:?}",
                    sum,
                    pretty_key(key),
                    self
                ));
            }
        }
        Ok(())
    }

    fn compute_checksum(&self, key: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(XXHASH_SEED);
        hasher.write(key);
        if let Some(bytes) = &self.bytes {
            hasher.write(bytes);
        }
        if let Some(integer) = self.integer {
            hasher.write(&integer.to_be_bytes());
        }
        hasher.finish()
    }
}

/// A key/value pair, as returned by scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Key,
    pub value: Value,
}

/// Transaction identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TxnId(pub u64);

impl TxnId {
    /// Draw a fresh random id.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// 64-bit hash of the id, used for record placement.
    pub fn location_hash(&self) -> u64 {
        let mut hasher = XxHash64::with_seed(XXHASH_SEED);
        hasher.write(&self.0.to_be_bytes());
        hasher.finish()
    }
}

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Transaction status. Committed and Aborted are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    Pending,
    Committed,
    Aborted,
}

impl TxnStatus {
    /// Whether the status admits no further transition.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Isolation {
    /// Snapshot isolation plus restart on commit-timestamp push.
    Serializable,
    /// Plain snapshot isolation; commits at a pushed timestamp.
    Snapshot,
}

/// A transaction record.
///
/// Created on the transaction's first write at the key derived from the id
/// hash; the copy embedded in requests carries the coordinator's current
/// view (epoch, timestamps, priority).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxnId,

    /// Human-readable tag for logs.
    pub name: String,

    /// Conflict priority. Higher wins pushes.
    pub priority: i32,

    pub isolation: Isolation,
    pub status: TxnStatus,

    /// Restart counter. Intents from older epochs are dead.
    pub epoch: u32,

    /// Provisional commit timestamp; pushed forward by conflicts.
    pub timestamp: Timestamp,

    /// Timestamp at which the transaction first started; reads observe
    /// this snapshot.
    pub orig_timestamp: Timestamp,

    /// Upper bound of the uncertainty interval
    /// (`orig_timestamp + max clock offset`).
    pub max_timestamp: Timestamp,

    /// Wall time of the last coordinator heartbeat.
    pub last_heartbeat: Option<Timestamp>,
}

impl Transaction {
    /// Create a new transaction at the given starting timestamp.
    pub fn new(
        name: impl Into<String>,
        isolation: Isolation,
        now: Timestamp,
        max_offset_nanos: i64,
    ) -> Self {
        Self {
            id: TxnId::random(),
            name: name.into(),
            priority: make_priority(None),
            isolation,
            status: TxnStatus::Pending,
            epoch: 0,
            timestamp: now,
            orig_timestamp: now,
            max_timestamp: now.add_nanos(max_offset_nanos),
            last_heartbeat: None,
        }
    }

    /// Restart the transaction for a new attempt.
    ///
    /// Bumps the epoch, moves the read snapshot up to `up_to` and ratchets
    /// the priority to at least `prio`.
    pub fn restart(&mut self, prio: i32, up_to: Timestamp, max_offset_nanos: i64) {
        self.epoch += 1;
        self.status = TxnStatus::Pending;
        if up_to > self.timestamp {
            self.timestamp = up_to;
        }
        self.orig_timestamp = self.timestamp;
        self.max_timestamp = self.orig_timestamp.add_nanos(max_offset_nanos);
        self.upgrade_priority(prio);
    }

    /// Ratchet priority upward; never downward.
    pub fn upgrade_priority(&mut self, minimum: i32) {
        if minimum > self.priority {
            self.priority = minimum;
        }
    }

    /// Fold updated state returned by a remote range into this copy.
    pub fn update(&mut self, other: &Transaction) {
        if other.id != self.id {
            return;
        }
        if other.status.is_terminal() {
            self.status = other.status;
        }
        if other.epoch > self.epoch {
            self.epoch = other.epoch;
        }
        self.timestamp.forward(other.timestamp);
        self.orig_timestamp.forward(other.orig_timestamp);
        self.max_timestamp.forward(other.max_timestamp);
        self.upgrade_priority(other.priority);
        if other.last_heartbeat.is_some() {
            self.last_heartbeat = other.last_heartbeat;
        }
    }
}

impl std::fmt::Display for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "\"{}\" id={} prio={} iso={:?} status={:?} epoch={} ts={}",
            self.name, self.id, self.priority, self.isolation, self.status, self.epoch, self.timestamp
        )
    }
}

/// Draw a transaction priority.
///
/// A user-supplied base is jittered so equal-priority transactions do not
/// deterministically livelock; absent a base the priority is a small
/// random positive number.
pub fn make_priority(base: Option<i32>) -> i32 {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    match base {
        Some(b) if b != 0 => b,
        _ => rng.gen_range(1..=i32::MAX / 2),
    }
}

/// A write intent: a provisional version owned by an uncommitted
/// transaction, addressed by key or key range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub key: Key,
    /// Exclusive end key for ranged intents; empty for point intents.
    pub end_key: Key,
    pub txn: Transaction,
}

/// Range identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct RangeId(pub u64);

impl std::fmt::Display for RangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Node identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Store identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct StoreId(pub u32);

impl std::fmt::Display for StoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Replica identifier, monotonically increasing per range.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ReplicaId(pub u32);

/// One copy of a range on one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub node_id: NodeId,
    pub store_id: StoreId,
    pub replica_id: ReplicaId,
}

impl std::fmt::Display for ReplicaDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{},{})", self.node_id, self.store_id, self.replica_id.0)
    }
}

/// Descriptor of one contiguous range `[start_key, end_key)`.
///
/// Stored under the meta addressing prefixes and updated transactionally
/// with split, merge, and replica-change commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub range_id: RangeId,

    /// First key in the range (inclusive).
    pub start_key: Key,

    /// First key past the range (exclusive).
    pub end_key: Key,

    pub replicas: Vec<ReplicaDescriptor>,

    /// Next replica id to allocate; ids are never reused.
    pub next_replica_id: ReplicaId,
}

impl RangeDescriptor {
    /// Whether `key` lies within this range.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice()
            && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }

    /// Whether the span `[start, end)` lies entirely within this range.
    /// A point request passes an empty `end`.
    pub fn contains_key_range(&self, start: &[u8], end: &[u8]) -> bool {
        if end.is_empty() {
            return self.contains_key(start);
        }
        self.contains_key(start)
            && (self.end_key.is_empty() || end <= self.end_key.as_slice())
    }

    /// The replica resident on the given store, if any.
    pub fn find_replica(&self, store_id: StoreId) -> Option<&ReplicaDescriptor> {
        self.replicas.iter().find(|r| r.store_id == store_id)
    }
}

impl std::fmt::Display for RangeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{},{})",
            self.range_id,
            pretty_key(&self.start_key),
            pretty_key(&self.end_key)
        )
    }
}

/// Running per-range MVCC statistics.
///
/// Deltas are computed alongside every mutation and applied atomically with
/// the write batch that carries it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvccStats {
    /// Bytes of live (visible, non-deleted) keys and values.
    pub live_bytes: i64,
    /// Bytes of all keys, live and historical.
    pub key_bytes: i64,
    /// Bytes of all values, live and historical.
    pub val_bytes: i64,
    /// Bytes held by unresolved intents.
    pub intent_bytes: i64,

    /// Count of live logical keys.
    pub live_count: i64,
    /// Count of all physical key records.
    pub key_count: i64,
    /// Count of all physical value records.
    pub val_count: i64,
    /// Count of unresolved intents.
    pub intent_count: i64,

    /// Accumulated age of unresolved intents, in seconds.
    pub intent_age: i64,
    /// Accumulated age of GC-eligible (non-live) bytes, in seconds.
    pub gc_bytes_age: i64,

    /// Wall time at which age accumulators were last advanced.
    pub last_update_nanos: i64,
}

impl MvccStats {
    /// Add another stats delta into this one.
    pub fn add(&mut self, delta: &MvccStats) {
        self.live_bytes += delta.live_bytes;
        self.key_bytes += delta.key_bytes;
        self.val_bytes += delta.val_bytes;
        self.intent_bytes += delta.intent_bytes;
        self.live_count += delta.live_count;
        self.key_count += delta.key_count;
        self.val_count += delta.val_count;
        self.intent_count += delta.intent_count;
        self.intent_age += delta.intent_age;
        self.gc_bytes_age += delta.gc_bytes_age;
        if delta.last_update_nanos > self.last_update_nanos {
            self.last_update_nanos = delta.last_update_nanos;
        }
    }

    /// Advance the age accumulators to `now_nanos`.
    pub fn age_to(&mut self, now_nanos: i64) {
        let elapsed_seconds = (now_nanos - self.last_update_nanos) / 1_000_000_000;
        if elapsed_seconds > 0 {
            self.intent_age += self.intent_count * elapsed_seconds;
            self.gc_bytes_age +=
                (self.key_bytes + self.val_bytes - self.live_bytes) * elapsed_seconds;
            self.last_update_nanos += elapsed_seconds * 1_000_000_000;
        }
    }

    /// Total bytes attributed to the range.
    pub fn total_bytes(&self) -> i64 {
        self.key_bytes + self.val_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_checksum_round_trip() {
        let mut v = Value::from_bytes(b"payload".to_vec());
        v.init_checksum(b"key");
        assert!(v.verify_checksum(b"key").is_ok());
        assert!(v.verify_checksum(b"other").is_err());
    }

    #[test]
    fn value_without_checksum_verifies() {
        let v = Value::from_integer(42);
        assert!(v.verify_checksum(b"anything").is_ok());
    }

    #[test]
    fn descriptor_containment() {
        let desc = RangeDescriptor {
            range_id: RangeId(1),
            start_key: b"b".to_vec(),
            end_key: b"m".to_vec(),
            replicas: vec![],
            next_replica_id: ReplicaId(1),
        };
        assert!(desc.contains_key(b"b"));
        assert!(desc.contains_key(b"lzzz"));
        assert!(!desc.contains_key(b"m"));
        assert!(!desc.contains_key(b"a"));
        assert!(desc.contains_key_range(b"b", b"m"));
        assert!(!desc.contains_key_range(b"b", b"n"));
        assert!(desc.contains_key_range(b"c", b""));
    }

    #[test]
    fn txn_restart_moves_snapshot_forward() {
        let now = Timestamp::new(100, 0);
        let mut txn = Transaction::new("test", Isolation::Serializable, now, 250);
        assert_eq!(txn.max_timestamp, Timestamp::new(350, 0));

        let pushed = Timestamp::new(500, 3);
        txn.restart(10, pushed, 250);
        assert_eq!(txn.epoch, 1);
        assert_eq!(txn.orig_timestamp, pushed);
        assert!(txn.priority >= 10);
    }

    #[test]
    fn stats_age_accumulation() {
        let mut stats = MvccStats {
            key_bytes: 100,
            val_bytes: 50,
            live_bytes: 120,
            intent_count: 2,
            last_update_nanos: 0,
            ..Default::default()
        };
        stats.age_to(10_000_000_000);
        assert_eq!(stats.intent_age, 20);
        assert_eq!(stats.gc_bytes_age, 300);
        assert_eq!(stats.last_update_nanos, 10_000_000_000);
    }
}
