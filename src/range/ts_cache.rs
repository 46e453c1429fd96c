//! Per-range timestamp cache.
//!
//! Records the highest timestamp at which key spans were read (and, in a
//! separate set, written). A writer proposing below a cached read
//! timestamp must advance past it, which is what makes reads lock-free:
//! instead of blocking writers, reads leave a watermark that pushes later
//! writers forward in time.
//!
//! Entries older than the retention window fold into the low water mark,
//! which bounds memory while keeping the cache conservative.

use crate::api::data::Key;
use crate::core::clock::Timestamp;
use crate::storage::keys;

/// How long entries are retained before folding into the low water mark.
pub const MIN_RETENTION_NANOS: i64 = 10 * 1_000_000_000;

#[derive(Debug, Clone)]
struct Entry {
    start: Key,
    end: Key,
    timestamp: Timestamp,
}

/// Interval cache of highest read/write timestamps for one range.
pub struct TimestampCache {
    low_water: Timestamp,
    reads: Vec<Entry>,
    writes: Vec<Entry>,
}

fn normalize_span(start: &[u8], end: &[u8]) -> (Key, Key) {
    if end.is_empty() {
        (start.to_vec(), keys::next_key(start))
    } else {
        (start.to_vec(), end.to_vec())
    }
}

impl TimestampCache {
    /// Create a cache with the given low water mark. Requests below the
    /// low water are pushed unconditionally, which makes a freshly
    /// initialized cache safe after lease transfers and restarts.
    pub fn new(low_water: Timestamp) -> Self {
        Self {
            low_water,
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// The current low water mark.
    pub fn low_water(&self) -> Timestamp {
        self.low_water
    }

    /// Record an access to `[start, end)` at `timestamp`.
    pub fn add(&mut self, start: &[u8], end: &[u8], timestamp: Timestamp, read_only: bool) {
        if timestamp <= self.low_water {
            return;
        }
        let (start, end) = normalize_span(start, end);
        let set = if read_only {
            &mut self.reads
        } else {
            &mut self.writes
        };
        set.push(Entry {
            start,
            end,
            timestamp,
        });
        self.evict(timestamp);
    }

    /// Highest cached timestamp overlapping `[start, end)` in the
    /// requested set; at least the low water mark.
    pub fn get_max(&self, start: &[u8], end: &[u8], read_only: bool) -> Timestamp {
        let (start, end) = normalize_span(start, end);
        let set = if read_only { &self.reads } else { &self.writes };
        let mut max = self.low_water;
        for entry in set {
            if start < entry.end && entry.start < end && entry.timestamp > max {
                max = entry.timestamp;
            }
        }
        max
    }

    /// Drop everything and restart the cache at `now`. Used when a
    /// replica acquires the lease: it cannot know what the previous
    /// holder served, so every timestamp below its clock is suspect.
    pub fn clear(&mut self, now: Timestamp) {
        self.reads.clear();
        self.writes.clear();
        self.low_water = now;
    }

    fn evict(&mut self, latest: Timestamp) {
        let cutoff = Timestamp::new(
            latest.wall_time.saturating_sub(MIN_RETENTION_NANOS),
            latest.logical,
        );
        if cutoff <= self.low_water {
            return;
        }
        let low_water = &mut self.low_water;
        let mut fold = |set: &mut Vec<Entry>| {
            set.retain(|e| {
                if e.timestamp < cutoff {
                    low_water.forward(e.timestamp);
                    false
                } else {
                    true
                }
            });
        };
        fold(&mut self.reads);
        fold(&mut self.writes);
        low_water.forward(cutoff);
    }

    /// Cached entry count, reads plus writes.
    pub fn len(&self) -> usize {
        self.reads.len() + self.writes.len()
    }

    /// Whether no entries are cached.
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }
}
