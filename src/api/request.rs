//! Typed request and response surface.
//!
//! Requests are a closed enum: each method pairs a request struct with a
//! response struct, and dispatch is a match, not open polymorphism. The
//! wire API addresses methods by name; internal components construct the
//! typed variants directly.

use crate::api::data::{
    Intent, Key, KeyValue, RangeDescriptor, RangeId, ReplicaDescriptor, Transaction, Value,
};
use crate::core::clock::Timestamp;
use crate::core::error::Error;
use crate::range::lease::Lease;
use serde::{Deserialize, Serialize};

/// Method names, one per request kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Put,
    ConditionalPut,
    Increment,
    Delete,
    DeleteRange,
    Scan,
    ReverseScan,
    EndTransaction,
    Batch,
    AdminSplit,
    AdminMerge,
    InternalRangeLookup,
    InternalHeartbeatTxn,
    InternalPushTxn,
    InternalResolveIntent,
    InternalGc,
    InternalTruncateLog,
    InternalLeaderLease,
    InternalChangeReplicas,
    InternalSplit,
    InternalMerge,
}

impl Method {
    /// Wire name, as used in the URL path.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "Get",
            Self::Put => "Put",
            Self::ConditionalPut => "ConditionalPut",
            Self::Increment => "Increment",
            Self::Delete => "Delete",
            Self::DeleteRange => "DeleteRange",
            Self::Scan => "Scan",
            Self::ReverseScan => "ReverseScan",
            Self::EndTransaction => "EndTransaction",
            Self::Batch => "Batch",
            Self::AdminSplit => "AdminSplit",
            Self::AdminMerge => "AdminMerge",
            Self::InternalRangeLookup => "InternalRangeLookup",
            Self::InternalHeartbeatTxn => "InternalHeartbeatTxn",
            Self::InternalPushTxn => "InternalPushTxn",
            Self::InternalResolveIntent => "InternalResolveIntent",
            Self::InternalGc => "InternalGc",
            Self::InternalTruncateLog => "InternalTruncateLog",
            Self::InternalLeaderLease => "InternalLeaderLease",
            Self::InternalChangeReplicas => "InternalChangeReplicas",
            Self::InternalSplit => "InternalSplit",
            Self::InternalMerge => "InternalMerge",
        }
    }

    /// Parse a wire name. Unknown names return `None`.
    pub fn from_str(name: &str) -> Option<Self> {
        Some(match name {
            "Get" => Self::Get,
            "Put" => Self::Put,
            "ConditionalPut" => Self::ConditionalPut,
            "Increment" => Self::Increment,
            "Delete" => Self::Delete,
            "DeleteRange" => Self::DeleteRange,
            "Scan" => Self::Scan,
            "ReverseScan" => Self::ReverseScan,
            "EndTransaction" => Self::EndTransaction,
            "Batch" => Self::Batch,
            "AdminSplit" => Self::AdminSplit,
            "AdminMerge" => Self::AdminMerge,
            _ => return None,
        })
    }

    /// Whether the method is part of the public API. Internal methods are
    /// rejected at the wire boundary.
    pub fn is_public(self) -> bool {
        matches!(
            self,
            Self::Get
                | Self::Put
                | Self::ConditionalPut
                | Self::Increment
                | Self::Delete
                | Self::DeleteRange
                | Self::Scan
                | Self::ReverseScan
                | Self::EndTransaction
                | Self::Batch
                | Self::AdminSplit
                | Self::AdminMerge
        )
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields common to every request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestHeader {
    /// First key affected (point requests use only this).
    pub key: Key,

    /// Exclusive end key for ranged requests; empty for point requests.
    pub end_key: Key,

    /// Operation timestamp. Zero lets the leaseholder assign its clock
    /// reading.
    pub timestamp: Timestamp,

    /// The enclosing transaction, if any.
    pub txn: Option<Transaction>,

    /// Caller-requested conflict priority for non-transactional requests.
    pub user_priority: Option<i32>,

    /// Range addressed by the sender; `RangeId(0)` means "resolve by key".
    pub range_id: RangeId,

    /// Replica the sender believes is the leaseholder.
    pub replica: Option<ReplicaDescriptor>,

    /// Authenticated user on whose behalf the request runs.
    pub user: String,
}

impl RequestHeader {
    /// A header spanning a single key.
    pub fn point(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    /// A header spanning `[key, end_key)`.
    pub fn span(key: impl Into<Key>, end_key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            end_key: end_key.into(),
            ..Default::default()
        }
    }
}

/// Fields common to every response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// Error, if the request failed.
    pub error: Option<Error>,

    /// Timestamp at which the operation executed.
    pub timestamp: Timestamp,

    /// Updated transaction state, echoed back to the coordinator.
    pub txn: Option<Transaction>,
}

macro_rules! request_types {
    ($($name:ident { $($field:ident : $ty:ty),* $(,)? })*) => {
        $(
            #[derive(Debug, Clone, Serialize, Deserialize)]
            pub struct $name {
                pub header: RequestHeader,
                $(pub $field: $ty,)*
            }
        )*
    };
}

request_types! {
    GetRequest {}
    PutRequest { value: Value }
    ConditionalPutRequest { value: Value, expected: Option<Value> }
    IncrementRequest { increment: i64 }
    DeleteRequest {}
    DeleteRangeRequest { max_entries_to_delete: u64 }
    ScanRequest { max_results: u64 }
    ReverseScanRequest { max_results: u64 }
    EndTransactionRequest { commit: bool, intents: Vec<Intent> }
    BatchRequest { requests: Vec<Request> }
    AdminSplitRequest { split_key: Key }
    AdminMergeRequest {}
    InternalRangeLookupRequest { max_ranges: u64 }
    InternalHeartbeatTxnRequest { now: Timestamp }
    InternalPushTxnRequest { pushee_txn: Transaction, push_type: PushTxnType, now: Timestamp }
    InternalResolveIntentRequest { intent_txn: Transaction }
    InternalGcRequest { gc_threshold: Timestamp }
    InternalTruncateLogRequest { index: u64 }
    InternalLeaderLeaseRequest { lease: Lease }
    InternalChangeReplicasRequest { change: ReplicaChange, change_token: u64 }
    InternalSplitRequest { updated_desc: RangeDescriptor, new_desc: RangeDescriptor, change_token: u64 }
    InternalMergeRequest { updated_desc: RangeDescriptor, subsumed_range_id: RangeId, change_token: u64 }
}

/// Kind of transaction push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushTxnType {
    /// Abort the pushee outright (write/write conflict).
    Abort,
    /// Only advance the pushee's timestamp (read/write conflict).
    Timestamp,
}

/// A replica set change applied with a descriptor update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicaChange {
    Add(ReplicaDescriptor),
    Remove(ReplicaDescriptor),
}

macro_rules! response_types {
    ($($name:ident { $($field:ident : $ty:ty),* $(,)? })*) => {
        $(
            #[derive(Debug, Clone, Default, Serialize, Deserialize)]
            pub struct $name {
                pub header: ResponseHeader,
                $(pub $field: $ty,)*
            }
        )*
    };
}

response_types! {
    GetResponse { value: Option<Value> }
    PutResponse {}
    ConditionalPutResponse {}
    IncrementResponse { new_value: i64 }
    DeleteResponse {}
    DeleteRangeResponse { num_deleted: u64 }
    ScanResponse { rows: Vec<KeyValue> }
    ReverseScanResponse { rows: Vec<KeyValue> }
    EndTransactionResponse { commit_wait: i64 }
    BatchResponse { responses: Vec<Response> }
    AdminSplitResponse {}
    AdminMergeResponse {}
    InternalRangeLookupResponse { ranges: Vec<RangeDescriptor> }
    InternalHeartbeatTxnResponse {}
    InternalPushTxnResponse { pushee_txn: Option<Transaction> }
    InternalResolveIntentResponse {}
    InternalGcResponse {}
    InternalTruncateLogResponse {}
    InternalLeaderLeaseResponse {}
    InternalChangeReplicasResponse {}
    InternalSplitResponse {}
    InternalMergeResponse {}
}

macro_rules! request_enum {
    ($($variant:ident => $req:ident / $resp:ident),* $(,)?) => {
        /// A typed request.
        #[derive(Debug, Clone, Serialize, Deserialize)]
        pub enum Request {
            $($variant($req),)*
        }

        /// A typed response.
        #[derive(Debug, Clone, Serialize, Deserialize)]
        pub enum Response {
            $($variant($resp),)*
        }

        impl Request {
            /// The method this request invokes.
            pub fn method(&self) -> Method {
                match self {
                    $(Self::$variant(_) => Method::$variant,)*
                }
            }

            /// Shared header, read-only.
            pub fn header(&self) -> &RequestHeader {
                match self {
                    $(Self::$variant(r) => &r.header,)*
                }
            }

            /// Shared header, mutable.
            pub fn header_mut(&mut self) -> &mut RequestHeader {
                match self {
                    $(Self::$variant(r) => &mut r.header,)*
                }
            }
        }

        impl Response {
            /// The method this response answers.
            pub fn method(&self) -> Method {
                match self {
                    $(Self::$variant(_) => Method::$variant,)*
                }
            }

            /// Shared header, read-only.
            pub fn header(&self) -> &ResponseHeader {
                match self {
                    $(Self::$variant(r) => &r.header,)*
                }
            }

            /// Shared header, mutable.
            pub fn header_mut(&mut self) -> &mut ResponseHeader {
                match self {
                    $(Self::$variant(r) => &mut r.header,)*
                }
            }
        }

        impl Response {
            /// An empty response of the kind matching `method`, used to
            /// carry an error back.
            pub fn empty_for(method: Method) -> Self {
                match method {
                    $(Method::$variant => Self::$variant($resp::default()),)*
                }
            }
        }
    };
}

request_enum! {
    Get => GetRequest / GetResponse,
    Put => PutRequest / PutResponse,
    ConditionalPut => ConditionalPutRequest / ConditionalPutResponse,
    Increment => IncrementRequest / IncrementResponse,
    Delete => DeleteRequest / DeleteResponse,
    DeleteRange => DeleteRangeRequest / DeleteRangeResponse,
    Scan => ScanRequest / ScanResponse,
    ReverseScan => ReverseScanRequest / ReverseScanResponse,
    EndTransaction => EndTransactionRequest / EndTransactionResponse,
    Batch => BatchRequest / BatchResponse,
    AdminSplit => AdminSplitRequest / AdminSplitResponse,
    AdminMerge => AdminMergeRequest / AdminMergeResponse,
    InternalRangeLookup => InternalRangeLookupRequest / InternalRangeLookupResponse,
    InternalHeartbeatTxn => InternalHeartbeatTxnRequest / InternalHeartbeatTxnResponse,
    InternalPushTxn => InternalPushTxnRequest / InternalPushTxnResponse,
    InternalResolveIntent => InternalResolveIntentRequest / InternalResolveIntentResponse,
    InternalGc => InternalGcRequest / InternalGcResponse,
    InternalTruncateLog => InternalTruncateLogRequest / InternalTruncateLogResponse,
    InternalLeaderLease => InternalLeaderLeaseRequest / InternalLeaderLeaseResponse,
    InternalChangeReplicas => InternalChangeReplicasRequest / InternalChangeReplicasResponse,
    InternalSplit => InternalSplitRequest / InternalSplitResponse,
    InternalMerge => InternalMergeRequest / InternalMergeResponse,
}

impl Request {
    /// Whether the request only reads.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Self::Get(_) | Self::Scan(_) | Self::ReverseScan(_) | Self::InternalRangeLookup(_)
        )
    }

    /// Whether the request is an admin operation, executed outside the
    /// per-range command pipeline.
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::AdminSplit(_) | Self::AdminMerge(_))
    }

    /// Whether the request operates over a key span (and an empty end
    /// key therefore means "unbounded" rather than "point").
    pub fn is_ranged(&self) -> bool {
        matches!(
            self,
            Self::Scan(_) | Self::ReverseScan(_) | Self::DeleteRange(_)
        ) || matches!(self, Self::InternalResolveIntent(r) if !r.header.end_key.is_empty())
    }

    /// The key span `[key, end)` this request touches, with point
    /// requests widened to their single key.
    pub fn key_span(&self) -> (&[u8], &[u8]) {
        let h = self.header();
        (&h.key, &h.end_key)
    }
}

impl Response {
    /// Construct an error response for `method`.
    pub fn from_error(method: Method, error: Error) -> Self {
        let mut resp = Self::empty_for(method);
        resp.header_mut().error = Some(error);
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_wire_names_round_trip() {
        for m in [
            Method::Get,
            Method::Put,
            Method::Scan,
            Method::ReverseScan,
            Method::EndTransaction,
            Method::Batch,
            Method::AdminSplit,
        ] {
            assert_eq!(Method::from_str(m.as_str()), Some(m));
        }
        // Internal methods never parse from the wire.
        assert_eq!(Method::from_str("InternalPushTxn"), None);
        assert_eq!(Method::from_str("Bogus"), None);
    }

    #[test]
    fn read_only_classification() {
        let get = Request::Get(GetRequest {
            header: RequestHeader::point(b"k".to_vec()),
        });
        assert!(get.is_read_only());
        let put = Request::Put(PutRequest {
            header: RequestHeader::point(b"k".to_vec()),
            value: Value::from_bytes(b"v".to_vec()),
        });
        assert!(!put.is_read_only());
        assert_eq!(get.method(), Method::Get);
    }

    #[test]
    fn error_response_carries_method() {
        let resp = Response::from_error(Method::Increment, Error::OpRequiresTxn);
        assert_eq!(resp.method(), Method::Increment);
        assert!(resp.header().error.is_some());
    }
}
