//! Meridian - distributed, geo-replicated, strongly-consistent key/value
//! datastore.
//!
//! Keys and values are opaque byte strings ordered lexicographically into
//! a single global sorted map, partitioned into contiguous ranges. Each
//! range is replicated through a per-range consensus group, and
//! cross-range mutations commit atomically through a distributed
//! transaction protocol providing serializable snapshot isolation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Wire API / CLI                           │
//! │          /kv/db/<Method> · binary or JSON payloads              │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │           Transaction Coordinator · Distributed Sender          │
//! │    record heartbeats │ intent tracking │ routing │ push/retry   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Store · Replica pipeline                    │
//! │  command queue │ timestamp cache │ consensus │ leases │ queues  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          MVCC / Engine                          │
//! │   versioned records │ intents │ stats │ ordered KV abstraction  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::clock`] - Hybrid logical clock
//! - [`core::config`] - Configuration and zone policy
//! - [`core::error`] - Error taxonomy and restart classification
//! - [`core::runtime`] - Stopper and worker lifecycle
//! - [`core::retry`] - Bounded exponential backoff
//!
//! ## API
//! - [`api::data`] - Keys, values, timestamps, transactions, descriptors
//! - [`api::request`] - Typed request/response surface
//!
//! ## Storage
//! - [`storage::engine`] - Ordered engine abstraction and in-memory engine
//! - [`storage::keys`] - Keyspace layout and physical key encoding
//! - [`storage::mvcc`] - Multi-version storage, intents, stats, GC
//!
//! ## Range
//! - [`range::command_queue`] - Overlap serialization per range
//! - [`range::ts_cache`] - Read timestamp cache
//! - [`range::raft`] - Per-range consensus groups
//! - [`range::lease`] - Leader leases
//! - [`range::replica`] - The command pipeline and apply loop
//! - [`range::store`] - Replica routing, bootstrap, admin operations
//! - [`range::queues`] - Split, GC, replicate, range-GC, verify queues
//!
//! ## Distribution
//! - [`dist::range_cache`] - Copy-on-write descriptor cache
//! - [`dist::sender`] - The distributed sender
//! - [`txn::coordinator`] - Transaction coordinator and restart policy
//!
//! ## Surface
//! - [`net`] - Wire codec, endpoint server, security
//! - [`ops::status`] - Node status channel
//! - [`node`] - Node assembly
//! - [`cli`] - Command-line interface

pub mod api;
pub mod cli;
pub mod core;
pub mod dist;
pub mod net;
pub mod node;
pub mod ops;
pub mod range;
pub mod storage;
pub mod txn;

pub use crate::core::error::{Error, Result};
