//! Error types and wire classification.
//!
//! Every response on the wire carries an optional error. Errors fall into
//! three propagation disciplines: retryable at the sender (routing is
//! refreshed and the request resent), transaction restart (the coordinator
//! reruns the transaction body), and fatal to the caller (surfaced
//! verbatim). The classification lives here as methods on the error enum so
//! the sender and the coordinator never match on message strings.

use crate::api::data::{
    Intent, Key, RangeDescriptor, RangeId, ReplicaDescriptor, Transaction, Value,
};
use crate::core::clock::Timestamp;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How an error affects the enclosing transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionRestart {
    /// The transaction is unaffected.
    None,
    /// Restart in a new epoch after exponential backoff.
    Backoff,
    /// Restart immediately.
    Immediate,
}

/// Datastore error taxonomy.
///
/// The variants mirror the wire contract: each carries the structured
/// detail a retrying sender or restarting coordinator needs.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum Error {
    /// The addressed replica does not hold the range lease.
    #[error("replica {replica:?} not leader; leader is {leader:?}")]
    NotLeader {
        replica: Option<ReplicaDescriptor>,
        leader: Option<ReplicaDescriptor>,
    },

    /// No replica of the named range exists on the addressed store.
    #[error("range {range_id} was not found")]
    RangeNotFound { range_id: RangeId },

    /// The request's key span lies outside the addressed range. Carries
    /// the correct descriptor when the store knows it, so the sender can
    /// repair its cache and retry.
    #[error("key range {} - {} outside of bounds of range",
            crate::api::data::pretty_key(request_start_key),
            crate::api::data::pretty_key(request_end_key))]
    RangeKeyMismatch {
        request_start_key: Key,
        request_end_key: Key,
        range: Option<RangeDescriptor>,
    },

    /// A lease request lost to an existing valid lease.
    #[error("cannot replace lease held by {existing:?}")]
    LeaseRejected { existing: Option<ReplicaDescriptor> },

    /// The operation ran into intents owned by other transactions.
    #[error("conflicting intents on {} key(s): resolved? {resolved}", intents.len())]
    WriteIntent { intents: Vec<Intent>, resolved: bool },

    /// A write at or below an existing committed version's timestamp.
    #[error("write too old: timestamp {timestamp} <= {existing_timestamp}")]
    WriteTooOld {
        timestamp: Timestamp,
        existing_timestamp: Timestamp,
    },

    /// Conditional put found a value other than the expected one.
    #[error("unexpected value: {actual_value:?}")]
    ConditionFailed { actual_value: Option<Value> },

    /// The transaction was aborted by a competing transaction.
    #[error("txn aborted: {txn}")]
    TransactionAborted { txn: Box<Transaction> },

    /// A push against a higher-priority transaction failed.
    #[error("failed to push {pushee_txn}")]
    TransactionPush {
        txn: Option<Box<Transaction>>,
        pushee_txn: Box<Transaction>,
    },

    /// The transaction must retry at a higher timestamp or epoch.
    #[error("retry txn: {txn}")]
    TransactionRetry { txn: Box<Transaction> },

    /// An operation observed the transaction record in an illegal state.
    #[error("txn {txn}: {msg}")]
    TransactionStatus { txn: Box<Transaction>, msg: String },

    /// A read observed a version ahead of its snapshot but inside the
    /// cluster's clock uncertainty window.
    #[error("read at {timestamp} encountered a write within the uncertainty interval at {existing_timestamp}")]
    ReadWithinUncertaintyInterval {
        timestamp: Timestamp,
        existing_timestamp: Timestamp,
    },

    /// The operation is only legal inside a transaction.
    #[error("the operation requires transactional context")]
    OpRequiresTxn,

    /// The node cannot currently serve requests.
    #[error("node unavailable; try another peer")]
    NodeUnavailable,

    /// A replica observed an unrecoverable storage fault and stopped.
    #[error("replica corruption: {message}")]
    ReplicaCorruption { message: String },

    /// Anything else. Not retryable.
    #[error("{message}")]
    Internal { message: String },
}

impl Error {
    /// Shorthand for an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the distributed sender may retry the request after
    /// refreshing its routing state.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotLeader { .. }
                | Self::RangeNotFound { .. }
                | Self::RangeKeyMismatch { .. }
                | Self::NodeUnavailable
                | Self::WriteIntent { resolved: true, .. }
        )
    }

    /// How the enclosing transaction must restart, if at all.
    pub fn transaction_restart(&self) -> TransactionRestart {
        match self {
            Self::TransactionRetry { .. } | Self::ReadWithinUncertaintyInterval { .. } => {
                TransactionRestart::Immediate
            }
            Self::TransactionAborted { .. } | Self::TransactionPush { .. } => {
                TransactionRestart::Backoff
            }
            _ => TransactionRestart::None,
        }
    }

    /// The updated transaction carried by the error, if any. The
    /// coordinator folds this into its local copy before restarting.
    pub fn transaction(&self) -> Option<&Transaction> {
        match self {
            Self::TransactionAborted { txn }
            | Self::TransactionRetry { txn }
            | Self::TransactionStatus { txn, .. } => Some(txn),
            Self::TransactionPush { txn, .. } => txn.as_deref(),
            _ => None,
        }
    }
}

/// Result alias for the datastore error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::data::Isolation;

    fn txn() -> Box<Transaction> {
        Box::new(Transaction::new(
            "t",
            Isolation::Serializable,
            Timestamp::new(1, 0),
            0,
        ))
    }

    #[test]
    fn retryable_classification() {
        assert!(Error::NodeUnavailable.is_retryable());
        assert!(Error::RangeNotFound {
            range_id: RangeId(1)
        }
        .is_retryable());
        assert!(!Error::OpRequiresTxn.is_retryable());
        assert!(!Error::WriteTooOld {
            timestamp: Timestamp::zero(),
            existing_timestamp: Timestamp::zero(),
        }
        .is_retryable());
        // Unresolved intents are not sender-retryable; the caller must push.
        assert!(!Error::WriteIntent {
            intents: vec![],
            resolved: false
        }
        .is_retryable());
        assert!(Error::WriteIntent {
            intents: vec![],
            resolved: true
        }
        .is_retryable());
    }

    #[test]
    fn restart_classification() {
        assert_eq!(
            Error::TransactionRetry { txn: txn() }.transaction_restart(),
            TransactionRestart::Immediate
        );
        assert_eq!(
            Error::TransactionAborted { txn: txn() }.transaction_restart(),
            TransactionRestart::Backoff
        );
        assert_eq!(
            Error::ReadWithinUncertaintyInterval {
                timestamp: Timestamp::zero(),
                existing_timestamp: Timestamp::zero(),
            }
            .transaction_restart(),
            TransactionRestart::Immediate
        );
        assert_eq!(
            Error::ConditionFailed { actual_value: None }.transaction_restart(),
            TransactionRestart::None
        );
    }
}
