//! Keyspace layout and physical key encoding.
//!
//! The global sorted map is carved into four regions, in engine order:
//!
//! - range-local keys under [`LOCAL_PREFIX`]: per-range bookkeeping
//!   (descriptor, applied index, lease, consensus hard state, log entries,
//!   stats). Never addressed through range routing.
//! - the two-level addressing index under the meta1/meta2 prefixes;
//! - well-known system keys (zone configuration, transaction records)
//!   under the system prefix;
//! - user keys in the remaining space.
//!
//! Logical keys become physical engine keys through an order-preserving
//! escape (`0x00` → `0x00 0xff`, terminated by `0x00 0x01`) so that a
//! key's metadata record and its timestamp-suffixed version records stay
//! contiguous regardless of embedded zero bytes. Version suffixes store
//! the bitwise complement of the timestamp so iteration from the metadata
//! sentinel yields versions newest-first.

use crate::api::data::{Key, RangeId, TxnId};
use crate::core::clock::Timestamp;

/// Smallest addressable key (inclusive bound of the keyspace).
pub const KEY_MIN: &[u8] = b"";

/// Largest addressable key (exclusive bound of the keyspace).
pub const KEY_MAX: &[u8] = &[0xff, 0xff];

/// Prefix for engine-local, non-addressable bookkeeping keys.
pub const LOCAL_PREFIX: &[u8] = &[0x00, 0x00, 0x00];

/// Prefix for the system keyspace.
pub const SYSTEM_PREFIX: &[u8] = &[0x00];

/// Addressing index, first level. Holds descriptors of meta2 ranges.
pub const META1_PREFIX: &[u8] = b"\x00\x00meta1";

/// Addressing index, second level. Holds descriptors of data ranges.
pub const META2_PREFIX: &[u8] = b"\x00\x00meta2";

/// Largest possible meta key; the boundary between addressing and system
/// records.
pub const META_MAX: &[u8] = b"\x00\x00meta3";

/// Well-known key holding the default zone configuration.
pub const ZONE_CONFIG_KEY: &[u8] = b"\x00zone";

/// Prefix for transaction records.
pub const TXN_PREFIX: &[u8] = b"\x00txn-";

/// First key available to users.
pub const USER_KEY_MIN: &[u8] = &[0x01];

const LOCAL_SUFFIX_DESCRIPTOR: &[u8] = b"desc";
const LOCAL_SUFFIX_APPLIED_INDEX: &[u8] = b"appl";
const LOCAL_SUFFIX_LEASE: &[u8] = b"leas";
const LOCAL_SUFFIX_HARD_STATE: &[u8] = b"hard";
const LOCAL_SUFFIX_STATS: &[u8] = b"stat";
const LOCAL_SUFFIX_LOG_ENTRY: &[u8] = b"rlog";
const LOCAL_SUFFIX_CHANGE_TOKEN: &[u8] = b"chtk";

fn local_range_id_key(range_id: RangeId, suffix: &[u8]) -> Key {
    let mut key = Vec::with_capacity(LOCAL_PREFIX.len() + 8 + suffix.len());
    key.extend_from_slice(LOCAL_PREFIX);
    key.extend_from_slice(&range_id.0.to_be_bytes());
    key.extend_from_slice(suffix);
    key
}

/// Range-local key for the persisted range descriptor.
pub fn range_descriptor_key(range_id: RangeId) -> Key {
    local_range_id_key(range_id, LOCAL_SUFFIX_DESCRIPTOR)
}

/// Range-local key for the last applied log index.
pub fn range_applied_index_key(range_id: RangeId) -> Key {
    local_range_id_key(range_id, LOCAL_SUFFIX_APPLIED_INDEX)
}

/// Range-local key for the leader lease.
pub fn range_lease_key(range_id: RangeId) -> Key {
    local_range_id_key(range_id, LOCAL_SUFFIX_LEASE)
}

/// Range-local key for consensus hard state (term, vote, commit).
pub fn range_hard_state_key(range_id: RangeId) -> Key {
    local_range_id_key(range_id, LOCAL_SUFFIX_HARD_STATE)
}

/// Range-local key for persisted MVCC stats.
pub fn range_stats_key(range_id: RangeId) -> Key {
    local_range_id_key(range_id, LOCAL_SUFFIX_STATS)
}

/// Range-local key for one consensus log entry.
pub fn range_log_entry_key(range_id: RangeId, index: u64) -> Key {
    let mut key = local_range_id_key(range_id, LOCAL_SUFFIX_LOG_ENTRY);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// Range-local prefix covering all log entries of a range.
pub fn range_log_prefix(range_id: RangeId) -> Key {
    local_range_id_key(range_id, LOCAL_SUFFIX_LOG_ENTRY)
}

/// Range-local key recording an applied descriptor-change token.
pub fn range_change_token_key(range_id: RangeId, token: u64) -> Key {
    let mut key = local_range_id_key(range_id, LOCAL_SUFFIX_CHANGE_TOKEN);
    key.extend_from_slice(&token.to_be_bytes());
    key
}

/// Zone configuration key for a key prefix; the empty prefix is the
/// cluster default.
pub fn zone_key(prefix: &[u8]) -> Key {
    let mut key = ZONE_CONFIG_KEY.to_vec();
    key.extend_from_slice(prefix);
    key
}

/// Key of a transaction record, derived from the hash of the id.
pub fn transaction_key(id: TxnId) -> Key {
    let mut key = Vec::with_capacity(TXN_PREFIX.len() + 8);
    key.extend_from_slice(TXN_PREFIX);
    key.extend_from_slice(&id.location_hash().to_be_bytes());
    key
}

/// Whether a key lives in the engine-local (non-addressable) region.
pub fn is_local(key: &[u8]) -> bool {
    key.starts_with(LOCAL_PREFIX)
}

/// Whether a key lives in the addressing index.
pub fn is_meta(key: &[u8]) -> bool {
    key.starts_with(META1_PREFIX) || key.starts_with(META2_PREFIX)
}

/// The addressing-index key at which the descriptor covering `key` is
/// found.
///
/// Data keys are looked up in meta2; meta2 keys in meta1; meta1 keys are
/// served from the root range directly (`KEY_MIN`).
pub fn range_meta_key(key: &[u8]) -> Key {
    if let Some(suffix) = key.strip_prefix(META2_PREFIX) {
        let mut meta = META1_PREFIX.to_vec();
        meta.extend_from_slice(suffix);
        return meta;
    }
    if key.starts_with(META1_PREFIX) {
        return KEY_MIN.to_vec();
    }
    let mut meta = META2_PREFIX.to_vec();
    meta.extend_from_slice(key);
    meta
}

/// The meta2 index record key for a descriptor ending at `end_key`.
///
/// Descriptors are indexed by their end key, so a single forward scan from
/// the lookup key finds the covering range.
pub fn range_addressing_key(end_key: &[u8]) -> Key {
    let mut meta = META2_PREFIX.to_vec();
    if end_key.is_empty() {
        meta.extend_from_slice(KEY_MAX);
    } else {
        meta.extend_from_slice(end_key);
    }
    meta
}

/// The key directly after `key`: the smallest key sorting above it.
pub fn next_key(key: &[u8]) -> Key {
    let mut next = key.to_vec();
    next.push(0);
    next
}

/// The exclusive upper bound of all keys starting with `prefix`. Returns
/// the empty key (meaning "unbounded") when no such bound exists.
pub fn prefix_end(prefix: &[u8]) -> Key {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last == 0xff {
            end.pop();
        } else {
            *last += 1;
            return end;
        }
    }
    Vec::new()
}

// ---------------------------------------------------------------------------
// MVCC physical key encoding
// ---------------------------------------------------------------------------

const ESCAPE: u8 = 0x00;
const ESCAPED_00: u8 = 0xff;
const TERMINATOR: [u8; 2] = [0x00, 0x01];

/// Suffix length of a versioned physical key.
pub const VERSION_SUFFIX_LEN: usize = 12;

fn escape_key(key: &[u8], out: &mut Vec<u8>) {
    for &b in key {
        if b == ESCAPE {
            out.push(ESCAPE);
            out.push(ESCAPED_00);
        } else {
            out.push(b);
        }
    }
    out.extend_from_slice(&TERMINATOR);
}

/// Encode a logical key into its physical metadata address.
pub fn mvcc_encode_meta_key(key: &[u8]) -> Key {
    let mut out = Vec::with_capacity(key.len() + 2);
    escape_key(key, &mut out);
    out
}

/// Encode a logical key plus version timestamp into its physical address.
///
/// The timestamp suffix stores the bitwise complement so larger timestamps
/// sort earlier: iteration from the metadata record visits versions
/// newest-first.
pub fn mvcc_encode_version_key(key: &[u8], timestamp: Timestamp) -> Key {
    let mut out = Vec::with_capacity(key.len() + 2 + VERSION_SUFFIX_LEN);
    escape_key(key, &mut out);
    out.extend_from_slice(&(!(timestamp.wall_time as u64)).to_be_bytes());
    out.extend_from_slice(&(!(timestamp.logical as u32)).to_be_bytes());
    out
}

/// Decode a physical key into its logical key and version timestamp.
///
/// Returns `None` for malformed keys. The timestamp is `None` for
/// metadata records.
pub fn mvcc_decode_key(physical: &[u8]) -> Option<(Key, Option<Timestamp>)> {
    let mut key = Vec::new();
    let mut i = 0;
    loop {
        let b = *physical.get(i)?;
        if b == ESCAPE {
            match *physical.get(i + 1)? {
                ESCAPED_00 => {
                    key.push(0x00);
                    i += 2;
                }
                0x01 => {
                    i += 2;
                    break;
                }
                _ => return None,
            }
        } else {
            key.push(b);
            i += 1;
        }
    }
    let suffix = &physical[i..];
    if suffix.is_empty() {
        return Some((key, None));
    }
    if suffix.len() != VERSION_SUFFIX_LEN {
        return None;
    }
    let wall = !u64::from_be_bytes(suffix[..8].try_into().ok()?);
    let logical = !u32::from_be_bytes(suffix[8..].try_into().ok()?);
    Some((key, Some(Timestamp::new(wall as i64, logical as i32))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_sorts_before_versions_newest_first() {
        let key = b"apple";
        let meta = mvcc_encode_meta_key(key);
        let v_new = mvcc_encode_version_key(key, Timestamp::new(100, 2));
        let v_mid = mvcc_encode_version_key(key, Timestamp::new(100, 1));
        let v_old = mvcc_encode_version_key(key, Timestamp::new(50, 0));
        assert!(meta < v_new);
        assert!(v_new < v_mid);
        assert!(v_mid < v_old);
    }

    #[test]
    fn embedded_zero_bytes_do_not_interleave() {
        // Versions of "a" must all sort before anything belonging to
        // "a\x00b", and both key families must stay contiguous.
        let a_meta = mvcc_encode_meta_key(b"a");
        let a_v = mvcc_encode_version_key(b"a", Timestamp::new(1, 0));
        let ab_meta = mvcc_encode_meta_key(b"a\x00b");
        let ab_v = mvcc_encode_version_key(b"a\x00b", Timestamp::new(u32::MAX as i64, 0));
        assert!(a_meta < a_v);
        assert!(a_v < ab_meta);
        assert!(ab_meta < ab_v);
    }

    #[test]
    fn encode_decode_round_trip() {
        for key in [&b""[..], b"a", b"key\x00with\x00zeros", b"\x00"] {
            let ts = Timestamp::new(12345, 7);
            let (k, decoded_ts) = mvcc_decode_key(&mvcc_encode_version_key(key, ts)).unwrap();
            assert_eq!(k, key);
            assert_eq!(decoded_ts, Some(ts));

            let (k, decoded_ts) = mvcc_decode_key(&mvcc_encode_meta_key(key)).unwrap();
            assert_eq!(k, key);
            assert_eq!(decoded_ts, None);
        }
    }

    #[test]
    fn addressing_keys() {
        // Data keys resolve through meta2, meta2 keys through meta1, and
        // meta1 keys at the root.
        let user = b"user-key";
        let meta2 = range_meta_key(user);
        assert!(meta2.starts_with(META2_PREFIX));
        let meta1 = range_meta_key(&meta2);
        assert!(meta1.starts_with(META1_PREFIX));
        assert_eq!(range_meta_key(&meta1), KEY_MIN.to_vec());
    }

    #[test]
    fn local_keys_sort_below_addressing() {
        let local = range_descriptor_key(RangeId(42));
        assert!(is_local(&local));
        assert!(local.as_slice() < META1_PREFIX);
        assert!(!is_local(META1_PREFIX));
    }

    #[test]
    fn transaction_keys_live_under_system_prefix() {
        let key = transaction_key(TxnId(7));
        assert!(key.starts_with(TXN_PREFIX));
        assert!(key.as_slice() > META_MAX);
        assert!(key.as_slice() < USER_KEY_MIN);
    }
}
