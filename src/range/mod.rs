//! Per-range machinery: command queue, timestamp cache, consensus,
//! replicas, the store, and its background queues.

pub mod command_queue;
pub mod lease;
pub mod queues;
pub mod raft;
pub mod replica;
pub mod store;
pub mod ts_cache;
