//! Multi-version concurrency control over an ordered engine.
//!
//! Each logical key owns one metadata record at its bare physical address
//! and N version records at timestamp-suffixed addresses, newest first.
//! The metadata tracks the newest version's timestamp and sizes, a deleted
//! flag, an optional intent reference to an uncommitted transaction, and
//! optionally an inline value stored at the zero timestamp outside the
//! versioned history.
//!
//! All mutation entry points read through the caller's pending write batch
//! (so a multi-operation command observes its own writes) and stage their
//! effects into it; the caller commits the batch atomically together with
//! whatever bookkeeping it carries. Every mutation also folds a stats
//! delta into the caller's [`MvccStats`].

use crate::api::data::{Intent, Key, KeyValue, MvccStats, Transaction, Value};
use crate::core::clock::Timestamp;
use crate::core::error::{Error, Result};
use crate::storage::engine::{EngineReader, WriteBatch};
use crate::storage::keys;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Metadata record for one logical key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MvccMetadata {
    /// The transaction owning the newest version, when it is an intent.
    pub txn: Option<Transaction>,

    /// Timestamp of the newest version.
    pub timestamp: Timestamp,

    /// Whether the newest version is a tombstone.
    pub deleted: bool,

    /// Physical key bytes of the newest version record.
    pub key_bytes: i64,

    /// Physical value bytes of the newest version record.
    pub val_bytes: i64,

    /// Inline value stored at the zero timestamp, bypassing versioning.
    pub inline: Option<Value>,
}

/// One version record: a value or a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionValue {
    pub deleted: bool,
    pub value: Value,
}

fn encode<T: Serialize>(v: &T) -> Result<Vec<u8>> {
    bincode::serialize(v).map_err(|e| Error::internal(format!("encode: {}", e)))
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    bincode::deserialize(raw).map_err(|e| Error::internal(format!("decode: {}", e)))
}

fn read_meta(reader: &dyn EngineReader, key: &[u8]) -> Result<Option<(MvccMetadata, usize)>> {
    match reader.get(&keys::mvcc_encode_meta_key(key))? {
        Some(raw) => {
            let len = raw.len();
            Ok(Some((decode(&raw)?, len)))
        }
        None => Ok(None),
    }
}

/// Upper bound of the physical records belonging to `key`.
fn version_scan_end(key: &[u8]) -> Key {
    keys::next_key(&keys::mvcc_encode_version_key(key, Timestamp::zero()))
}

// ---------------------------------------------------------------------------
// Stats accounting
//
// The incremental deltas below and `compute_stats` share one definition:
// every physical record contributes its key and encoded-value sizes to
// key_bytes/val_bytes; the newest live version (plus its metadata record)
// contributes to live_bytes; intents contribute the newest version's sizes
// to intent_bytes. Age accumulators advance with `MvccStats::age_to`.
// ---------------------------------------------------------------------------

fn add_meta_contrib(stats: &mut MvccStats, meta_key_len: usize, meta_len: usize, meta: &MvccMetadata) {
    stats.key_bytes += meta_key_len as i64;
    stats.val_bytes += meta_len as i64;
    if meta.inline.is_some() {
        stats.live_count += 1;
        stats.live_bytes += (meta_key_len + meta_len) as i64;
        return;
    }
    if !meta.deleted {
        stats.live_count += 1;
        stats.live_bytes += (meta_key_len + meta_len) as i64 + meta.key_bytes + meta.val_bytes;
    }
    if meta.txn.is_some() {
        stats.intent_count += 1;
        stats.intent_bytes += meta.key_bytes + meta.val_bytes;
    }
}

fn subtract_meta_contrib(
    stats: &mut MvccStats,
    meta_key_len: usize,
    meta_len: usize,
    meta: &MvccMetadata,
) {
    let mut inverse = MvccStats::default();
    add_meta_contrib(&mut inverse, meta_key_len, meta_len, meta);
    stats.key_bytes -= inverse.key_bytes;
    stats.val_bytes -= inverse.val_bytes;
    stats.live_count -= inverse.live_count;
    stats.live_bytes -= inverse.live_bytes;
    stats.intent_count -= inverse.intent_count;
    stats.intent_bytes -= inverse.intent_bytes;
}

fn add_version_contrib(stats: &mut MvccStats, key_len: usize, val_len: usize) {
    stats.key_bytes += key_len as i64;
    stats.val_bytes += val_len as i64;
    stats.val_count += 1;
}

fn subtract_version_contrib(stats: &mut MvccStats, key_len: usize, val_len: usize) {
    stats.key_bytes -= key_len as i64;
    stats.val_bytes -= val_len as i64;
    stats.val_count -= 1;
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// Return the newest value visible at `read_ts`, excluding tombstones.
///
/// Transactional reads see their own intents; a foreign intent fails with
/// `WriteIntent`, and a version inside the transaction's uncertainty
/// interval fails with `ReadWithinUncertaintyInterval`.
pub fn get(
    reader: &dyn EngineReader,
    key: &[u8],
    read_ts: Timestamp,
    txn: Option<&Transaction>,
) -> Result<Option<Value>> {
    let Some((meta, _)) = read_meta(reader, key)? else {
        return Ok(None);
    };

    if let Some(inline) = &meta.inline {
        inline.verify_checksum(key).map_err(Error::internal)?;
        return Ok(Some(inline.clone()));
    }

    if let Some(intent_txn) = &meta.txn {
        let own = txn.map(|t| t.id == intent_txn.id).unwrap_or(false);
        if own && intent_txn.epoch >= txn.unwrap().epoch {
            // Our own intent: read its version directly, whatever its
            // timestamp.
            return read_version_at(reader, key, meta.timestamp);
        }
        return Err(Error::WriteIntent {
            intents: vec![Intent {
                key: key.to_vec(),
                end_key: vec![],
                txn: intent_txn.clone(),
            }],
            resolved: false,
        });
    }

    // Seek the newest version at or below the uncertainty limit; anything
    // found above read_ts is a possibly-causally-prior write on another
    // node's clock.
    let seek_ts = match txn {
        Some(t) if t.max_timestamp > read_ts => t.max_timestamp,
        _ => read_ts,
    };
    let start = keys::mvcc_encode_version_key(key, seek_ts);
    let found = reader.scan(&start, &version_scan_end(key), 1)?;
    let Some((phys, raw)) = found.into_iter().next() else {
        return Ok(None);
    };
    let (decoded_key, version_ts) =
        keys::mvcc_decode_key(&phys).ok_or_else(|| Error::internal("malformed version key"))?;
    debug_assert_eq!(decoded_key, key);
    let version_ts = version_ts.ok_or_else(|| Error::internal("version record without timestamp"))?;

    if txn.is_some() && version_ts > read_ts {
        return Err(Error::ReadWithinUncertaintyInterval {
            timestamp: read_ts,
            existing_timestamp: version_ts,
        });
    }

    let version: VersionValue = decode(&raw)?;
    if version.deleted {
        return Ok(None);
    }
    version.value.verify_checksum(key).map_err(Error::internal)?;
    Ok(Some(version.value))
}

fn read_version_at(
    reader: &dyn EngineReader,
    key: &[u8],
    ts: Timestamp,
) -> Result<Option<Value>> {
    let Some(raw) = reader.get(&keys::mvcc_encode_version_key(key, ts))? else {
        return Ok(None);
    };
    let version: VersionValue = decode(&raw)?;
    if version.deleted {
        return Ok(None);
    }
    version.value.verify_checksum(key).map_err(Error::internal)?;
    Ok(Some(version.value))
}

/// Scan `[start, end)` returning at most `max` visible key/value pairs
/// (0 = unbounded), applying the same per-key visibility rules as [`get`].
pub fn scan(
    reader: &dyn EngineReader,
    start: &[u8],
    end: &[u8],
    read_ts: Timestamp,
    max: usize,
    reverse: bool,
    txn: Option<&Transaction>,
) -> Result<Vec<KeyValue>> {
    let phys_start = keys::mvcc_encode_meta_key(start);
    let phys_end = if end.is_empty() {
        keys::mvcc_encode_meta_key(keys::KEY_MAX)
    } else {
        keys::mvcc_encode_meta_key(end)
    };

    // Walk logical keys in order, delegating per-key visibility to `get`.
    // The per-key jump keeps the scan proportional to the number of
    // logical keys rather than physical versions.
    let mut out = Vec::new();
    if reverse {
        let mut upper = phys_end;
        loop {
            let found = reader.reverse_scan(&phys_start, &upper, 1)?;
            let Some((phys, _)) = found.into_iter().next() else {
                break;
            };
            let (logical, _) = keys::mvcc_decode_key(&phys)
                .ok_or_else(|| Error::internal("malformed physical key"))?;
            if let Some(value) = get(reader, &logical, read_ts, txn)? {
                out.push(KeyValue {
                    key: logical.clone(),
                    value,
                });
                if max != 0 && out.len() >= max {
                    break;
                }
            }
            upper = keys::mvcc_encode_meta_key(&logical);
        }
    } else {
        let mut lower = phys_start;
        loop {
            let found = reader.scan(&lower, &phys_end, 1)?;
            let Some((phys, _)) = found.into_iter().next() else {
                break;
            };
            let (logical, _) = keys::mvcc_decode_key(&phys)
                .ok_or_else(|| Error::internal("malformed physical key"))?;
            if let Some(value) = get(reader, &logical, read_ts, txn)? {
                out.push(KeyValue {
                    key: logical.clone(),
                    value,
                });
                if max != 0 && out.len() >= max {
                    break;
                }
            }
            lower = version_scan_end(&logical);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Write a version of `key` at `timestamp`.
///
/// A transactional put writes an intent; a non-transactional put writes
/// the version directly. Fails with `WriteTooOld` when a newer committed
/// version exists and with `WriteIntent` when another transaction's intent
/// is present.
pub fn put(
    base: &dyn EngineReader,
    batch: &mut WriteBatch,
    stats: &mut MvccStats,
    key: &[u8],
    timestamp: Timestamp,
    value: Value,
    txn: Option<&Transaction>,
    now_nanos: i64,
) -> Result<()> {
    write_version(
        base,
        batch,
        stats,
        key,
        timestamp,
        VersionValue {
            deleted: false,
            value,
        },
        txn,
        now_nanos,
    )
}

/// Write a tombstone for `key` at `timestamp`.
pub fn delete(
    base: &dyn EngineReader,
    batch: &mut WriteBatch,
    stats: &mut MvccStats,
    key: &[u8],
    timestamp: Timestamp,
    txn: Option<&Transaction>,
    now_nanos: i64,
) -> Result<()> {
    write_version(
        base,
        batch,
        stats,
        key,
        timestamp,
        VersionValue {
            deleted: true,
            value: Value::default(),
        },
        txn,
        now_nanos,
    )
}

#[allow(clippy::too_many_arguments)]
fn write_version(
    base: &dyn EngineReader,
    batch: &mut WriteBatch,
    stats: &mut MvccStats,
    key: &[u8],
    timestamp: Timestamp,
    mut version: VersionValue,
    txn: Option<&Transaction>,
    now_nanos: i64,
) -> Result<()> {
    if timestamp.is_zero() {
        return Err(Error::internal("versioned write at the zero timestamp"));
    }
    if !version.deleted && version.value.checksum.is_none() {
        version.value.init_checksum(key);
    }

    let overlay = batch.overlay(base);
    let meta_key = keys::mvcc_encode_meta_key(key);
    let old = read_meta(&overlay, key)?;

    stats.age_to(now_nanos);

    let mut own_intent_replaced: Option<Timestamp> = None;
    if let Some((old_meta, _)) = &old {
        if old_meta.inline.is_some() {
            return Err(Error::internal("versioned write over an inline value"));
        }
        match (&old_meta.txn, txn) {
            (Some(intent_txn), Some(our_txn)) if intent_txn.id == our_txn.id => {
                // Rewriting our own intent (retry within an epoch, or a
                // new epoch superseding a stale attempt).
                own_intent_replaced = Some(old_meta.timestamp);
            }
            (Some(intent_txn), _) => {
                return Err(Error::WriteIntent {
                    intents: vec![Intent {
                        key: key.to_vec(),
                        end_key: vec![],
                        txn: intent_txn.clone(),
                    }],
                    resolved: false,
                });
            }
            (None, _) => {
                if old_meta.timestamp >= timestamp {
                    return Err(Error::WriteTooOld {
                        timestamp,
                        existing_timestamp: old_meta.timestamp,
                    });
                }
            }
        }
    }

    let version_key = keys::mvcc_encode_version_key(key, timestamp);
    let version_raw = encode(&version)?;

    let new_meta = MvccMetadata {
        txn: txn.cloned(),
        timestamp,
        deleted: version.deleted,
        key_bytes: version_key.len() as i64,
        val_bytes: version_raw.len() as i64,
        inline: None,
    };
    let new_meta_raw = encode(&new_meta)?;

    // Stats: retire the old metadata contribution (and replaced intent
    // version), then account the new version and metadata.
    match &old {
        Some((old_meta, old_meta_len)) => {
            subtract_meta_contrib(stats, meta_key.len(), *old_meta_len, old_meta);
            if let Some(replaced_ts) = own_intent_replaced {
                let old_vkey = keys::mvcc_encode_version_key(key, replaced_ts);
                subtract_version_contrib(
                    stats,
                    old_vkey.len(),
                    old_meta.val_bytes as usize,
                );
                if replaced_ts != timestamp {
                    batch.delete(old_vkey);
                }
            }
        }
        None => {
            stats.key_count += 1;
        }
    }
    add_version_contrib(stats, version_key.len(), version_raw.len());
    add_meta_contrib(stats, meta_key.len(), new_meta_raw.len(), &new_meta);

    batch.put(version_key, version_raw);
    batch.put(meta_key, new_meta_raw);
    Ok(())
}

/// Write `value` only if the currently visible value matches `expected`
/// (`None` means "expect absent"). On mismatch fails with
/// `ConditionFailed` carrying the actual value.
#[allow(clippy::too_many_arguments)]
pub fn conditional_put(
    base: &dyn EngineReader,
    batch: &mut WriteBatch,
    stats: &mut MvccStats,
    key: &[u8],
    timestamp: Timestamp,
    value: Value,
    expected: Option<&Value>,
    txn: Option<&Transaction>,
    now_nanos: i64,
) -> Result<()> {
    let overlay = batch.overlay(base);
    let read_ts = txn.map(|t| t.timestamp).unwrap_or(timestamp);
    let actual = get(&overlay, key, read_ts, txn)?;
    let matches = match (&actual, expected) {
        (None, None) => true,
        (Some(actual), Some(expected)) => {
            actual.bytes == expected.bytes && actual.integer == expected.integer
        }
        _ => false,
    };
    if !matches {
        return Err(Error::ConditionFailed {
            actual_value: actual,
        });
    }
    put(base, batch, stats, key, timestamp, value, txn, now_nanos)
}

/// Add `delta` to the integer value at `key` (0 if absent) and return the
/// new value.
#[allow(clippy::too_many_arguments)]
pub fn increment(
    base: &dyn EngineReader,
    batch: &mut WriteBatch,
    stats: &mut MvccStats,
    key: &[u8],
    timestamp: Timestamp,
    delta: i64,
    txn: Option<&Transaction>,
    now_nanos: i64,
) -> Result<i64> {
    let overlay = batch.overlay(base);
    let read_ts = txn.map(|t| t.timestamp).unwrap_or(timestamp);
    let prior = match get(&overlay, key, read_ts, txn)? {
        Some(value) => match value.integer {
            Some(i) => i,
            None => {
                return Err(Error::internal(format!(
                    "key {} does not hold an integer value",
                    crate::api::data::pretty_key(key)
                )))
            }
        },
        None => 0,
    };
    let updated = prior
        .checked_add(delta)
        .ok_or_else(|| Error::internal("integer overflow on increment"))?;
    put(
        base,
        batch,
        stats,
        key,
        timestamp,
        Value::from_integer(updated),
        txn,
        now_nanos,
    )?;
    Ok(updated)
}

/// Write tombstones for every visible key in `[start, end)`; returns the
/// deleted keys' count. `max` bounds the deletion (0 = unbounded).
#[allow(clippy::too_many_arguments)]
pub fn delete_range(
    base: &dyn EngineReader,
    batch: &mut WriteBatch,
    stats: &mut MvccStats,
    start: &[u8],
    end: &[u8],
    timestamp: Timestamp,
    max: usize,
    txn: Option<&Transaction>,
    now_nanos: i64,
) -> Result<u64> {
    let visible = {
        let overlay = batch.overlay(base);
        let read_ts = txn.map(|t| t.timestamp).unwrap_or(timestamp);
        scan(&overlay, start, end, read_ts, max, false, txn)?
    };
    let mut deleted = 0;
    for kv in visible {
        delete(base, batch, stats, &kv.key, timestamp, txn, now_nanos)?;
        deleted += 1;
    }
    Ok(deleted)
}

// ---------------------------------------------------------------------------
// Intent resolution
// ---------------------------------------------------------------------------

/// Resolve the intent at `key` owned by `txn`, committing or removing it
/// according to the transaction's final status. Idempotent: resolving a
/// key without a matching intent is a no-op.
pub fn resolve_intent(
    base: &dyn EngineReader,
    batch: &mut WriteBatch,
    stats: &mut MvccStats,
    key: &[u8],
    txn: &Transaction,
    now_nanos: i64,
) -> Result<()> {
    let overlay = batch.overlay(base);
    let meta_key = keys::mvcc_encode_meta_key(key);
    let Some((meta, meta_len)) = read_meta(&overlay, key)? else {
        return Ok(());
    };
    let Some(intent_txn) = &meta.txn else {
        return Ok(());
    };
    if intent_txn.id != txn.id {
        return Ok(());
    }

    stats.age_to(now_nanos);

    // A commit only carries intents written in the committing epoch;
    // stale-epoch intents are leftovers from a restarted attempt and are
    // removed like aborted ones.
    let commit = txn.status == crate::api::data::TxnStatus::Committed
        && intent_txn.epoch == txn.epoch;

    if commit {
        let mut new_meta = meta.clone();
        new_meta.txn = None;
        subtract_meta_contrib(stats, meta_key.len(), meta_len, &meta);

        // The coordinator may have pushed the commit timestamp past the
        // timestamp the intent was written at; move the version record.
        if txn.timestamp > meta.timestamp {
            let old_vkey = keys::mvcc_encode_version_key(key, meta.timestamp);
            let new_vkey = keys::mvcc_encode_version_key(key, txn.timestamp);
            let raw = overlay
                .get(&old_vkey)?
                .ok_or_else(|| Error::internal("intent version record missing"))?;
            subtract_version_contrib(stats, old_vkey.len(), raw.len());
            add_version_contrib(stats, new_vkey.len(), raw.len());
            batch.delete(old_vkey);
            batch.put(new_vkey, raw);
            new_meta.timestamp = txn.timestamp;
            new_meta.key_bytes = keys::mvcc_encode_version_key(key, txn.timestamp).len() as i64;
        }

        let new_meta_raw = encode(&new_meta)?;
        add_meta_contrib(stats, meta_key.len(), new_meta_raw.len(), &new_meta);
        batch.put(meta_key, new_meta_raw);
        return Ok(());
    }

    // Abort: drop the intent version and restore the metadata from the
    // next-newest version, if any.
    let intent_vkey = keys::mvcc_encode_version_key(key, meta.timestamp);
    let next = overlay.scan(&keys::next_key(&intent_vkey), &version_scan_end(key), 1)?;
    subtract_meta_contrib(stats, meta_key.len(), meta_len, &meta);
    subtract_version_contrib(stats, intent_vkey.len(), meta.val_bytes as usize);
    batch.delete(intent_vkey);
    match next.into_iter().next() {
        Some((phys, raw)) => {
            let (_, prev_ts) = keys::mvcc_decode_key(&phys)
                .ok_or_else(|| Error::internal("malformed version key"))?;
            let prev_ts =
                prev_ts.ok_or_else(|| Error::internal("version record without timestamp"))?;
            let prev: VersionValue = decode(&raw)?;
            let restored = MvccMetadata {
                txn: None,
                timestamp: prev_ts,
                deleted: prev.deleted,
                key_bytes: phys.len() as i64,
                val_bytes: raw.len() as i64,
                inline: None,
            };
            let restored_raw = encode(&restored)?;
            add_meta_contrib(stats, meta_key.len(), restored_raw.len(), &restored);
            batch.put(meta_key, restored_raw);
        }
        None => {
            // No committed history: the key disappears entirely.
            stats.key_count -= 1;
            batch.delete(meta_key);
        }
    }
    Ok(())
}

/// Resolve every intent of `txn` within `[start, end)`, up to `max`
/// (0 = unbounded). Returns the number of intents resolved.
#[allow(clippy::too_many_arguments)]
pub fn resolve_intent_range(
    base: &dyn EngineReader,
    batch: &mut WriteBatch,
    stats: &mut MvccStats,
    start: &[u8],
    end: &[u8],
    txn: &Transaction,
    max: usize,
    now_nanos: i64,
) -> Result<u64> {
    // Collect matching intent keys first; resolution rewrites metadata.
    let matches = {
        let overlay = batch.overlay(base);
        let phys_start = keys::mvcc_encode_meta_key(start);
        let phys_end = if end.is_empty() {
            keys::mvcc_encode_meta_key(keys::KEY_MAX)
        } else {
            keys::mvcc_encode_meta_key(end)
        };
        let mut found = Vec::new();
        let mut lower = phys_start;
        loop {
            let batch_scan = overlay.scan(&lower, &phys_end, 1)?;
            let Some((phys, _)) = batch_scan.into_iter().next() else {
                break;
            };
            let (logical, _) = keys::mvcc_decode_key(&phys)
                .ok_or_else(|| Error::internal("malformed physical key"))?;
            if let Some((meta, _)) = read_meta(&overlay, &logical)? {
                if meta.txn.as_ref().map(|t| t.id) == Some(txn.id) {
                    found.push(logical.clone());
                    if max != 0 && found.len() >= max {
                        break;
                    }
                }
            }
            lower = version_scan_end(&logical);
        }
        found
    };

    let mut resolved = 0;
    for key in matches {
        resolve_intent(base, batch, stats, &key, txn, now_nanos)?;
        resolved += 1;
    }
    Ok(resolved)
}

// ---------------------------------------------------------------------------
// Inline records
// ---------------------------------------------------------------------------

/// Read a bincode-encoded record stored as an inline value.
pub fn get_record<T: DeserializeOwned>(reader: &dyn EngineReader, key: &[u8]) -> Result<Option<T>> {
    match get(reader, key, Timestamp::max(), None)? {
        Some(value) => {
            let raw = value
                .bytes
                .ok_or_else(|| Error::internal("record value without bytes"))?;
            Ok(Some(decode(&raw)?))
        }
        None => Ok(None),
    }
}

/// Store a bincode-encoded record as an inline value (zero timestamp,
/// outside the versioned history).
pub fn put_record<T: Serialize>(
    base: &dyn EngineReader,
    batch: &mut WriteBatch,
    stats: &mut MvccStats,
    key: &[u8],
    record: &T,
    now_nanos: i64,
) -> Result<()> {
    let mut value = Value::from_bytes(encode(record)?);
    value.init_checksum(key);

    let overlay = batch.overlay(base);
    let meta_key = keys::mvcc_encode_meta_key(key);
    let old = read_meta(&overlay, key)?;

    stats.age_to(now_nanos);

    let meta = MvccMetadata {
        txn: None,
        timestamp: Timestamp::zero(),
        deleted: false,
        key_bytes: 0,
        val_bytes: 0,
        inline: Some(value),
    };
    let meta_raw = encode(&meta)?;
    match &old {
        Some((old_meta, old_len)) => {
            if old_meta.inline.is_none() {
                return Err(Error::internal("inline write over a versioned key"));
            }
            subtract_meta_contrib(stats, meta_key.len(), *old_len, old_meta);
        }
        None => stats.key_count += 1,
    }
    add_meta_contrib(stats, meta_key.len(), meta_raw.len(), &meta);
    batch.put(meta_key, meta_raw);
    Ok(())
}

/// Remove an inline record. A no-op when absent.
pub fn delete_record(
    base: &dyn EngineReader,
    batch: &mut WriteBatch,
    stats: &mut MvccStats,
    key: &[u8],
    now_nanos: i64,
) -> Result<()> {
    let overlay = batch.overlay(base);
    let meta_key = keys::mvcc_encode_meta_key(key);
    if let Some((meta, meta_len)) = read_meta(&overlay, key)? {
        stats.age_to(now_nanos);
        subtract_meta_contrib(stats, meta_key.len(), meta_len, &meta);
        stats.key_count -= 1;
        batch.delete(meta_key);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Garbage collection and split points
// ---------------------------------------------------------------------------

/// Remove versions of keys in `[start, end)` superseded before
/// `threshold`. Never removes the newest non-tombstone version nor
/// intents; a key whose newest version is a tombstone older than the
/// threshold is removed entirely. Returns the number of records dropped.
pub fn garbage_collect(
    base: &dyn EngineReader,
    batch: &mut WriteBatch,
    stats: &mut MvccStats,
    start: &[u8],
    end: &[u8],
    threshold: Timestamp,
    now_nanos: i64,
) -> Result<u64> {
    stats.age_to(now_nanos);

    // Read phase: decide what to drop. Mutations are staged afterwards so
    // the scan sees a stable view.
    struct KeyGc {
        meta: Option<(Key, MvccMetadata, usize)>,
        versions: Vec<(Key, usize)>,
    }
    let mut plan: Vec<KeyGc> = Vec::new();
    {
        let overlay = batch.overlay(base);
        let phys_start = keys::mvcc_encode_meta_key(start);
        let phys_end = if end.is_empty() {
            keys::mvcc_encode_meta_key(keys::KEY_MAX)
        } else {
            keys::mvcc_encode_meta_key(end)
        };

        let mut lower = phys_start;
        loop {
            let found = overlay.scan(&lower, &phys_end, 1)?;
            let Some((phys, _)) = found.into_iter().next() else {
                break;
            };
            let (logical, _) = keys::mvcc_decode_key(&phys)
                .ok_or_else(|| Error::internal("malformed physical key"))?;
            lower = version_scan_end(&logical);

            let Some((meta, meta_len)) = read_meta(&overlay, &logical)? else {
                continue;
            };
            if meta.txn.is_some() || meta.inline.is_some() {
                continue;
            }

            let meta_key = keys::mvcc_encode_meta_key(&logical);
            let versions =
                overlay.scan(&keys::next_key(&meta_key), &version_scan_end(&logical), 0)?;

            if meta.deleted && meta.timestamp <= threshold {
                // Tombstone older than the threshold at the newest
                // position: the whole key goes.
                plan.push(KeyGc {
                    meta: Some((meta_key, meta, meta_len)),
                    versions: versions
                        .into_iter()
                        .map(|(k, v)| (k, v.len()))
                        .collect(),
                });
                continue;
            }

            // Find the first (newest-first) version at or below the
            // threshold: the keeper. Everything older is unreachable by
            // any legal read.
            let mut keeper_index = None;
            for (i, (vphys, _)) in versions.iter().enumerate() {
                let (_, ts) = keys::mvcc_decode_key(vphys)
                    .ok_or_else(|| Error::internal("malformed version key"))?;
                let ts =
                    ts.ok_or_else(|| Error::internal("version record without timestamp"))?;
                if ts <= threshold {
                    keeper_index = Some(i);
                    break;
                }
            }
            if let Some(keeper) = keeper_index {
                let removable: Vec<(Key, usize)> = versions
                    .into_iter()
                    .skip(keeper + 1)
                    .map(|(k, v)| (k, v.len()))
                    .collect();
                if !removable.is_empty() {
                    plan.push(KeyGc {
                        meta: None,
                        versions: removable,
                    });
                }
            }
        }
    }

    let mut dropped = 0;
    for key_gc in plan {
        if let Some((meta_key, meta, meta_len)) = key_gc.meta {
            subtract_meta_contrib(stats, meta_key.len(), meta_len, &meta);
            stats.key_count -= 1;
            batch.delete(meta_key);
        }
        for (vphys, vlen) in key_gc.versions {
            subtract_version_contrib(stats, vphys.len(), vlen);
            batch.delete(vphys);
            dropped += 1;
        }
    }
    Ok(dropped)
}

/// Find a key splitting `[start, end)` into two halves of roughly equal
/// physical size. Returns `None` when the span holds fewer than two
/// logical keys.
pub fn find_split_key(
    reader: &dyn EngineReader,
    start: &[u8],
    end: &[u8],
) -> Result<Option<Key>> {
    let phys_start = keys::mvcc_encode_meta_key(start);
    let phys_end = if end.is_empty() {
        keys::mvcc_encode_meta_key(keys::KEY_MAX)
    } else {
        keys::mvcc_encode_meta_key(end)
    };
    let records = reader.scan(&phys_start, &phys_end, 0)?;
    if records.is_empty() {
        return Ok(None);
    }
    let total: usize = records.iter().map(|(k, v)| k.len() + v.len()).sum();

    let mut acc = 0usize;
    for (phys, raw) in &records {
        acc += phys.len() + raw.len();
        if acc * 2 >= total {
            let (logical, _) = keys::mvcc_decode_key(phys)
                .ok_or_else(|| Error::internal("malformed physical key"))?;
            // Splitting at the first key would produce an empty left
            // half; there is no usable split point in that case.
            if logical.as_slice() == start {
                continue;
            }
            return Ok(Some(logical));
        }
    }
    Ok(None)
}

/// Recompute stats for `[start, end)` from the physical records.
///
/// Shares its definition with the incremental deltas; age accumulators
/// are derived from version timestamps relative to `now_nanos`.
pub fn compute_stats(
    reader: &dyn EngineReader,
    start: &[u8],
    end: &[u8],
    now_nanos: i64,
) -> Result<MvccStats> {
    let phys_start = keys::mvcc_encode_meta_key(start);
    let phys_end = if end.is_empty() {
        keys::mvcc_encode_meta_key(keys::KEY_MAX)
    } else {
        keys::mvcc_encode_meta_key(end)
    };

    let mut stats = MvccStats {
        last_update_nanos: now_nanos,
        ..Default::default()
    };

    let mut lower = phys_start;
    loop {
        let found = reader.scan(&lower, &phys_end, 1)?;
        let Some((phys, _)) = found.into_iter().next() else {
            break;
        };
        let (logical, _) = keys::mvcc_decode_key(&phys)
            .ok_or_else(|| Error::internal("malformed physical key"))?;
        lower = version_scan_end(&logical);

        let Some((meta, meta_len)) = read_meta(reader, &logical)? else {
            continue;
        };
        let meta_key = keys::mvcc_encode_meta_key(&logical);
        stats.key_count += 1;
        add_meta_contrib(&mut stats, meta_key.len(), meta_len, &meta);
        if meta.txn.is_some() {
            stats.intent_age += (now_nanos - meta.timestamp.wall_time).max(0) / 1_000_000_000;
        }

        let versions = reader.scan(&keys::next_key(&meta_key), &version_scan_end(&logical), 0)?;
        for (i, (vphys, vraw)) in versions.iter().enumerate() {
            add_version_contrib(&mut stats, vphys.len(), vraw.len());
            let newest = i == 0;
            let live = newest && !meta.deleted;
            if !live {
                let (_, ts) = keys::mvcc_decode_key(vphys)
                    .ok_or_else(|| Error::internal("malformed version key"))?;
                let ts = ts.ok_or_else(|| Error::internal("version record without timestamp"))?;
                stats.gc_bytes_age += ((vphys.len() + vraw.len()) as i64)
                    * ((now_nanos - ts.wall_time).max(0) / 1_000_000_000);
            }
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::data::{Isolation, TxnStatus};
    use crate::storage::engine::{Engine, MemEngine};

    fn ts(wall: i64) -> Timestamp {
        Timestamp::new(wall, 0)
    }

    struct Db {
        engine: std::sync::Arc<MemEngine>,
        stats: MvccStats,
    }

    impl Db {
        fn new() -> Self {
            Self {
                engine: MemEngine::new(),
                stats: MvccStats::default(),
            }
        }

        fn put(&mut self, key: &[u8], value: &[u8], at: Timestamp, txn: Option<&Transaction>) -> Result<()> {
            let mut batch = WriteBatch::new();
            put(
                self.engine.as_ref(),
                &mut batch,
                &mut self.stats,
                key,
                at,
                Value::from_bytes(value.to_vec()),
                txn,
                at.wall_time,
            )?;
            self.engine.write(batch)
        }

        fn delete(&mut self, key: &[u8], at: Timestamp, txn: Option<&Transaction>) -> Result<()> {
            let mut batch = WriteBatch::new();
            delete(self.engine.as_ref(), &mut batch, &mut self.stats, key, at, txn, at.wall_time)?;
            self.engine.write(batch)
        }

        fn get_bytes(&self, key: &[u8], at: Timestamp, txn: Option<&Transaction>) -> Result<Option<Vec<u8>>> {
            Ok(get(self.engine.as_ref(), key, at, txn)?.and_then(|v| v.bytes))
        }
    }

    fn txn_at(at: Timestamp) -> Transaction {
        Transaction::new("test", Isolation::Serializable, at, 0)
    }

    #[test]
    fn put_get_round_trip() {
        let mut db = Db::new();
        db.put(b"k", b"v1", ts(1), None).unwrap();
        db.put(b"k", b"v2", ts(3), None).unwrap();

        assert_eq!(db.get_bytes(b"k", ts(1), None).unwrap(), Some(b"v1".to_vec()));
        assert_eq!(db.get_bytes(b"k", ts(2), None).unwrap(), Some(b"v1".to_vec()));
        assert_eq!(db.get_bytes(b"k", ts(3), None).unwrap(), Some(b"v2".to_vec()));
        assert_eq!(db.get_bytes(b"k", ts(9), None).unwrap(), Some(b"v2".to_vec()));
        assert_eq!(db.get_bytes(b"missing", ts(9), None).unwrap(), None);
    }

    #[test]
    fn tombstones_hide_older_versions() {
        let mut db = Db::new();
        db.put(b"k", b"v1", ts(1), None).unwrap();
        db.delete(b"k", ts(2), None).unwrap();
        assert_eq!(db.get_bytes(b"k", ts(3), None).unwrap(), None);
        // Reads below the tombstone still see the old version.
        assert_eq!(db.get_bytes(b"k", ts(1), None).unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn write_too_old_reports_existing_timestamp() {
        let mut db = Db::new();
        db.put(b"k", b"v1", ts(5), None).unwrap();
        let err = db.put(b"k", b"v2", ts(5), None).unwrap_err();
        match err {
            Error::WriteTooOld {
                existing_timestamp, ..
            } => assert_eq!(existing_timestamp, ts(5)),
            other => panic!("expected WriteTooOld, got {other:?}"),
        }
        // The caller restarts one tick past the reported timestamp.
        db.put(b"k", b"v2", ts(5).next(), None).unwrap();
    }

    #[test]
    fn foreign_intent_blocks_reads_and_writes() {
        let mut db = Db::new();
        let writer = txn_at(ts(10));
        db.put(b"k", b"provisional", ts(10), Some(&writer)).unwrap();

        assert!(matches!(
            db.get_bytes(b"k", ts(11), None),
            Err(Error::WriteIntent { .. })
        ));
        assert!(matches!(
            db.put(b"k", b"other", ts(11), None),
            Err(Error::WriteIntent { .. })
        ));

        // The owner reads its own provisional value.
        assert_eq!(
            db.get_bytes(b"k", ts(10), Some(&writer)).unwrap(),
            Some(b"provisional".to_vec())
        );
    }

    #[test]
    fn uncertainty_interval_read() {
        let mut db = Db::new();
        db.put(b"k", b"future", ts(100), None).unwrap();

        // Reader at 50 with max offset extending to 150: the version at
        // 100 may causally precede the read.
        let mut reader = txn_at(ts(50));
        reader.max_timestamp = ts(150);
        assert!(matches!(
            db.get_bytes(b"k", ts(50), Some(&reader)),
            Err(Error::ReadWithinUncertaintyInterval { .. })
        ));

        // With the interval ending before the version, the read simply
        // misses it.
        reader.max_timestamp = ts(90);
        assert_eq!(db.get_bytes(b"k", ts(50), Some(&reader)).unwrap(), None);

        // A non-transactional read has no uncertainty interval.
        assert_eq!(db.get_bytes(b"k", ts(50), None).unwrap(), None);
    }

    #[test]
    fn resolve_intent_commit_and_abort() {
        let mut db = Db::new();
        db.put(b"k", b"base", ts(1), None).unwrap();

        let mut writer = txn_at(ts(10));
        db.put(b"k", b"provisional", ts(10), Some(&writer)).unwrap();

        // Abort: the provisional version vanishes and the base value is
        // restored.
        writer.status = TxnStatus::Aborted;
        let mut batch = WriteBatch::new();
        resolve_intent(db.engine.as_ref(), &mut batch, &mut db.stats, b"k", &writer, 10).unwrap();
        db.engine.write(batch).unwrap();
        assert_eq!(db.get_bytes(b"k", ts(20), None).unwrap(), Some(b"base".to_vec()));
        assert_eq!(db.stats.intent_count, 0);

        // Commit path, with a pushed timestamp.
        let mut writer = txn_at(ts(30));
        db.put(b"k", b"committed", ts(30), Some(&writer)).unwrap();
        writer.status = TxnStatus::Committed;
        writer.timestamp = ts(45);
        let mut batch = WriteBatch::new();
        resolve_intent(db.engine.as_ref(), &mut batch, &mut db.stats, b"k", &writer, 45).unwrap();
        db.engine.write(batch).unwrap();
        assert_eq!(db.get_bytes(b"k", ts(44), None).unwrap(), Some(b"base".to_vec()));
        assert_eq!(db.get_bytes(b"k", ts(45), None).unwrap(), Some(b"committed".to_vec()));

        // Idempotent: a second resolve is a no-op.
        let before = db.stats;
        let mut batch = WriteBatch::new();
        resolve_intent(db.engine.as_ref(), &mut batch, &mut db.stats, b"k", &writer, 45).unwrap();
        assert!(batch.is_empty());
        assert_eq!(before, db.stats);
    }

    #[test]
    fn scan_orders_and_limits() {
        let mut db = Db::new();
        for (k, v) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3"), (b"d", b"4")] {
            db.put(k, v, ts(1), None).unwrap();
        }
        db.delete(b"c", ts(2), None).unwrap();

        let kvs = scan(db.engine.as_ref(), b"a", b"", ts(5), 0, false, None).unwrap();
        assert_eq!(
            kvs.iter().map(|kv| kv.key.clone()).collect::<Vec<_>>(),
            vec![b"a".to_vec(), b"b".to_vec(), b"d".to_vec()]
        );

        let kvs = scan(db.engine.as_ref(), b"b", b"d", ts(5), 0, false, None).unwrap();
        assert_eq!(kvs.len(), 1, "c is deleted, d is excluded");

        let kvs = scan(db.engine.as_ref(), b"a", b"", ts(5), 2, false, None).unwrap();
        assert_eq!(kvs.len(), 2);

        let kvs = scan(db.engine.as_ref(), b"a", b"", ts(5), 0, true, None).unwrap();
        assert_eq!(kvs.first().unwrap().key, b"d".to_vec());
    }

    #[test]
    fn increment_semantics() {
        let mut db = Db::new();
        let mut batch = WriteBatch::new();
        let v = increment(db.engine.as_ref(), &mut batch, &mut db.stats, b"cnt", ts(1), 5, None, 1)
            .unwrap();
        db.engine.write(batch).unwrap();
        assert_eq!(v, 5);

        let mut batch = WriteBatch::new();
        let v = increment(db.engine.as_ref(), &mut batch, &mut db.stats, b"cnt", ts(2), -3, None, 2)
            .unwrap();
        db.engine.write(batch).unwrap();
        assert_eq!(v, 2);

        let value = get(db.engine.as_ref(), b"cnt", ts(3), None).unwrap().unwrap();
        assert_eq!(value.integer, Some(2));
    }

    #[test]
    fn conditional_put_expectations() {
        let mut db = Db::new();

        // Expect-absent succeeds on a missing key.
        let mut batch = WriteBatch::new();
        conditional_put(
            db.engine.as_ref(), &mut batch, &mut db.stats,
            b"k", ts(1), Value::from_bytes(b"v1".to_vec()), None, None, 1,
        )
        .unwrap();
        db.engine.write(batch).unwrap();

        // Expect-absent now fails and reports the actual value.
        let mut batch = WriteBatch::new();
        let err = conditional_put(
            db.engine.as_ref(), &mut batch, &mut db.stats,
            b"k", ts(2), Value::from_bytes(b"v2".to_vec()), None, None, 2,
        )
        .unwrap_err();
        match err {
            Error::ConditionFailed { actual_value } => {
                assert_eq!(actual_value.unwrap().bytes, Some(b"v1".to_vec()));
            }
            other => panic!("expected ConditionFailed, got {other:?}"),
        }

        // Matching expectation succeeds.
        let mut batch = WriteBatch::new();
        conditional_put(
            db.engine.as_ref(), &mut batch, &mut db.stats,
            b"k", ts(3), Value::from_bytes(b"v2".to_vec()),
            Some(&Value::from_bytes(b"v1".to_vec())), None, 3,
        )
        .unwrap();
        db.engine.write(batch).unwrap();
        assert_eq!(db.get_bytes(b"k", ts(4), None).unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn gc_keeps_newest_and_intents() {
        let mut db = Db::new();
        db.put(b"k", b"v1", ts(1), None).unwrap();
        db.put(b"k", b"v2", ts(2), None).unwrap();
        db.put(b"k", b"v3", ts(10), None).unwrap();

        let mut batch = WriteBatch::new();
        let dropped = garbage_collect(
            db.engine.as_ref(), &mut batch, &mut db.stats, b"", b"", ts(5), 10,
        )
        .unwrap();
        db.engine.write(batch).unwrap();
        // v1 is superseded by v2 before the threshold; v2 is the keeper
        // for reads in (2, 10); v3 is newest.
        assert_eq!(dropped, 1);
        assert_eq!(db.get_bytes(b"k", ts(20), None).unwrap(), Some(b"v3".to_vec()));
        assert_eq!(db.get_bytes(b"k", ts(3), None).unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn gc_removes_expired_tombstoned_keys() {
        let mut db = Db::new();
        db.put(b"k", b"v1", ts(1), None).unwrap();
        db.delete(b"k", ts(2), None).unwrap();

        let mut batch = WriteBatch::new();
        garbage_collect(db.engine.as_ref(), &mut batch, &mut db.stats, b"", b"", ts(5), 10)
            .unwrap();
        db.engine.write(batch).unwrap();

        assert_eq!(db.engine.len(), 0);
        assert_eq!(db.stats.key_count, 0);
        assert_eq!(db.stats.key_bytes, 0);
        assert_eq!(db.stats.val_bytes, 0);
    }

    #[test]
    fn incremental_stats_match_computed() {
        let mut db = Db::new();
        db.put(b"a", b"1", ts(1), None).unwrap();
        db.put(b"a", b"22", ts(3), None).unwrap();
        db.put(b"b", b"333", ts(2), None).unwrap();
        db.delete(b"b", ts(4), None).unwrap();
        let writer = txn_at(ts(5));
        db.put(b"c", b"4444", ts(5), Some(&writer)).unwrap();

        let computed = compute_stats(db.engine.as_ref(), b"", b"", 5).unwrap();
        assert_eq!(db.stats.key_bytes, computed.key_bytes);
        assert_eq!(db.stats.val_bytes, computed.val_bytes);
        assert_eq!(db.stats.live_bytes, computed.live_bytes);
        assert_eq!(db.stats.intent_bytes, computed.intent_bytes);
        assert_eq!(db.stats.key_count, computed.key_count);
        assert_eq!(db.stats.val_count, computed.val_count);
        assert_eq!(db.stats.live_count, computed.live_count);
        assert_eq!(db.stats.intent_count, computed.intent_count);
    }

    #[test]
    fn find_split_key_midpoint() {
        let mut db = Db::new();
        for i in 0..10u8 {
            let key = vec![b'k', b'0' + i];
            db.put(&key, &[0u8; 32], ts(1 + i as i64), None).unwrap();
        }
        let split = find_split_key(db.engine.as_ref(), b"", b"").unwrap().unwrap();
        assert!(split > b"k0".to_vec());
        assert!(split < b"k9".to_vec());
    }

    #[test]
    fn inline_records_round_trip() {
        let mut db = Db::new();
        let mut batch = WriteBatch::new();
        put_record(db.engine.as_ref(), &mut batch, &mut db.stats, b"rec", &42u64, 1).unwrap();
        db.engine.write(batch).unwrap();
        assert_eq!(get_record::<u64>(db.engine.as_ref(), b"rec").unwrap(), Some(42));

        let mut batch = WriteBatch::new();
        delete_record(db.engine.as_ref(), &mut batch, &mut db.stats, b"rec", 2).unwrap();
        db.engine.write(batch).unwrap();
        assert_eq!(get_record::<u64>(db.engine.as_ref(), b"rec").unwrap(), None);
        assert_eq!(db.stats.key_count, 0);
    }

    #[test]
    fn empty_key_is_a_valid_key() {
        let mut db = Db::new();
        db.put(b"", b"root", ts(1), None).unwrap();
        assert_eq!(db.get_bytes(b"", ts(2), None).unwrap(), Some(b"root".to_vec()));
    }
}
