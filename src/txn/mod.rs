//! Client-side transaction machinery.

pub mod coordinator;

pub use coordinator::{run_transaction, Txn, TxnOptions};
