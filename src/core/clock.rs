//! Hybrid logical clock.
//!
//! Every node carries one clock instance. Timestamps combine a wall-clock
//! reading in nanoseconds with a logical counter that breaks ties between
//! events captured within the same nanosecond. The clock is monotone per
//! node: `now` never moves backwards, and `update` folds in remote
//! timestamps so that causally-related events order correctly across nodes
//! without a global clock.
//!
//! The maximum clock offset bounds how far apart two node clocks may drift;
//! it defines the uncertainty interval applied to transactional reads.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A hybrid logical timestamp.
///
/// Ordered by `(wall_time, logical)`. The zero timestamp is reserved for
/// inline (unversioned) values and never issued by a clock.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Wall-clock reading in nanoseconds since the Unix epoch.
    pub wall_time: i64,

    /// Logical tie-breaker within a single wall nanosecond.
    pub logical: i32,
}

impl Timestamp {
    /// Create a timestamp from raw parts.
    pub const fn new(wall_time: i64, logical: i32) -> Self {
        Self { wall_time, logical }
    }

    /// The zero timestamp.
    pub const fn zero() -> Self {
        Self {
            wall_time: 0,
            logical: 0,
        }
    }

    /// The maximum representable timestamp.
    pub const fn max() -> Self {
        Self {
            wall_time: i64::MAX,
            logical: i32::MAX,
        }
    }

    /// Whether this is the zero timestamp.
    pub const fn is_zero(self) -> bool {
        self.wall_time == 0 && self.logical == 0
    }

    /// The immediately following timestamp.
    pub const fn next(self) -> Self {
        if self.logical == i32::MAX {
            Self {
                wall_time: self.wall_time + 1,
                logical: 0,
            }
        } else {
            Self {
                wall_time: self.wall_time,
                logical: self.logical + 1,
            }
        }
    }

    /// The immediately preceding timestamp.
    pub const fn prev(self) -> Self {
        if self.logical > 0 {
            Self {
                wall_time: self.wall_time,
                logical: self.logical - 1,
            }
        } else {
            Self {
                wall_time: self.wall_time - 1,
                logical: i32::MAX,
            }
        }
    }

    /// This timestamp advanced by a wall-time delta.
    pub const fn add_nanos(self, nanos: i64) -> Self {
        Self {
            wall_time: self.wall_time + nanos,
            logical: self.logical,
        }
    }

    /// Forward this timestamp to `other` if `other` is later.
    pub fn forward(&mut self, other: Timestamp) {
        if other > *self {
            *self = other;
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09},{}", self.wall_time / 1_000_000_000, self.wall_time % 1_000_000_000, self.logical)
    }
}

/// Source of wall-clock readings.
///
/// Production uses the system clock; tests substitute a manually advanced
/// source so timestamp-dependent behavior is deterministic.
pub trait WallTimeSource: Send + Sync {
    /// Current wall time in nanoseconds since the Unix epoch.
    fn now_nanos(&self) -> i64;
}

/// System wall-clock source.
#[derive(Debug, Default)]
pub struct SystemTimeSource;

impl WallTimeSource for SystemTimeSource {
    fn now_nanos(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0)
    }
}

/// Manually advanced wall-clock source for tests.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    nanos: AtomicI64,
}

impl ManualTimeSource {
    /// Create a manual source starting at the given reading.
    pub fn new(nanos: i64) -> Self {
        Self {
            nanos: AtomicI64::new(nanos),
        }
    }

    /// Set the wall-clock reading.
    pub fn set(&self, nanos: i64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }

    /// Advance the wall-clock reading.
    pub fn advance(&self, nanos: i64) {
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl WallTimeSource for ManualTimeSource {
    fn now_nanos(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

/// Hybrid logical clock.
///
/// `now` and `update` implement the standard HLC rules: the clock reads the
/// wall source, takes the max of (wall reading, internal state, remote
/// timestamp), and bumps the logical counter when the wall component does
/// not advance.
pub struct Clock {
    source: Arc<dyn WallTimeSource>,

    /// Bound on clock offset between any two nodes, in nanoseconds.
    max_offset_nanos: i64,

    state: Mutex<Timestamp>,
}

impl Clock {
    /// Create a clock over the given wall source.
    pub fn new(source: Arc<dyn WallTimeSource>, max_offset_nanos: i64) -> Self {
        Self {
            source,
            max_offset_nanos,
            state: Mutex::new(Timestamp::zero()),
        }
    }

    /// Create a clock over the system wall source.
    pub fn system(max_offset_nanos: i64) -> Self {
        Self::new(Arc::new(SystemTimeSource), max_offset_nanos)
    }

    /// The configured maximum clock offset in nanoseconds.
    pub fn max_offset_nanos(&self) -> i64 {
        self.max_offset_nanos
    }

    /// Raw wall reading, without updating clock state.
    pub fn physical_now(&self) -> i64 {
        self.source.now_nanos()
    }

    /// Issue the next timestamp.
    pub fn now(&self) -> Timestamp {
        let wall = self.source.now_nanos();
        let mut state = self.state.lock();
        if wall > state.wall_time {
            *state = Timestamp::new(wall, 0);
        } else {
            *state = state.next();
        }
        *state
    }

    /// Fold a remote timestamp into the clock and return the updated reading.
    ///
    /// Guarantees the returned timestamp exceeds both the clock's previous
    /// state and `remote`.
    pub fn update(&self, remote: Timestamp) -> Timestamp {
        let wall = self.source.now_nanos();
        let mut state = self.state.lock();
        let mut next = *state;
        next.forward(remote);
        next = next.next();
        if wall > next.wall_time {
            next = Timestamp::new(wall, 0);
        }
        *state = next;
        *state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_ordering() {
        let a = Timestamp::new(1, 0);
        let b = Timestamp::new(1, 1);
        let c = Timestamp::new(2, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.next(), b);
        assert_eq!(b.prev(), a);
        assert_eq!(c.prev().next(), c);
    }

    #[test]
    fn clock_monotone_on_stalled_wall() {
        let source = Arc::new(ManualTimeSource::new(100));
        let clock = Clock::new(source.clone(), 0);
        let t1 = clock.now();
        let t2 = clock.now();
        let t3 = clock.now();
        assert!(t1 < t2 && t2 < t3);
        assert_eq!(t1.wall_time, 100);
        assert_eq!(t3.logical, t1.logical + 2);

        source.advance(50);
        let t4 = clock.now();
        assert_eq!(t4, Timestamp::new(150, 0));
    }

    #[test]
    fn clock_update_folds_remote() {
        let source = Arc::new(ManualTimeSource::new(100));
        let clock = Clock::new(source, 0);
        let remote = Timestamp::new(500, 7);
        let updated = clock.update(remote);
        assert!(updated > remote);
        // Subsequent readings stay ahead of the folded remote time.
        assert!(clock.now() > remote);
    }
}
