//! Leader leases.
//!
//! A lease grants one replica the right to serve reads and propose writes
//! for its range over a bounded wall-clock interval. Leases are granted by
//! a consensus-committed command, so every replica applies the same lease
//! history; validity at serving time is judged against the local clock.

use crate::api::data::{ReplicaDescriptor, StoreId};
use crate::core::clock::Timestamp;
use serde::{Deserialize, Serialize};

/// A leader lease over one range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    /// Timestamp at which the lease takes effect.
    pub start: Timestamp,

    /// Absolute expiration. The holder stops serving at this time; other
    /// replicas may not request a replacement until it has passed (plus
    /// clock offset slop, enforced by the grantor).
    pub expiration: Timestamp,

    /// The replica holding the lease.
    pub replica: ReplicaDescriptor,
}

impl Lease {
    /// Whether the lease is in effect at `now`.
    pub fn covers(&self, now: Timestamp) -> bool {
        self.start <= now && now < self.expiration
    }

    /// Whether the lease belongs to a replica on the given store.
    pub fn owned_by(&self, store_id: StoreId) -> bool {
        self.replica.store_id == store_id
    }
}

impl std::fmt::Display for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lease {} [{} - {})",
            self.replica, self.start, self.expiration
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::data::{NodeId, ReplicaId};

    fn lease(start: i64, end: i64) -> Lease {
        Lease {
            start: Timestamp::new(start, 0),
            expiration: Timestamp::new(end, 0),
            replica: ReplicaDescriptor {
                node_id: NodeId(1),
                store_id: StoreId(1),
                replica_id: ReplicaId(1),
            },
        }
    }

    #[test]
    fn coverage_window_is_half_open() {
        let l = lease(10, 20);
        assert!(!l.covers(Timestamp::new(9, 0)));
        assert!(l.covers(Timestamp::new(10, 0)));
        assert!(l.covers(Timestamp::new(19, 999)));
        assert!(!l.covers(Timestamp::new(20, 0)));
    }
}
