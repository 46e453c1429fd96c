//! Transaction coordinator.
//!
//! One coordinator instance manages one transaction attempt: it tags
//! requests with the transaction, creates the transaction record on the
//! first write and heartbeats it from then on, accumulates the written
//! intent spans, and drives commit or abort. [`run_transaction`] wraps
//! attempts in the restart policy: immediate for retry and uncertainty
//! errors, exponential backoff (and a fresh transaction identity) after
//! aborts and failed pushes.

use crate::api::data::{Intent, Isolation, Key, Transaction, TxnStatus, Value};
use crate::api::request::{
    DeleteRequest, EndTransactionRequest, GetRequest, IncrementRequest,
    InternalHeartbeatTxnRequest, InternalResolveIntentRequest, Method, PutRequest, Request,
    RequestHeader, Response, ScanRequest,
};
use crate::core::clock::Clock;
use crate::core::error::{Error, Result, TransactionRestart};
use crate::core::retry::{Backoff, RetryOptions};
use crate::dist::KvSender;
use crate::storage::keys;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Options for [`run_transaction`].
#[derive(Debug, Clone)]
pub struct TxnOptions {
    /// Tag for logs and the transaction record.
    pub name: String,
    pub isolation: Isolation,
}

/// One transaction attempt.
pub struct Txn {
    sender: Arc<dyn KvSender>,
    clock: Arc<Clock>,
    heartbeat_timeout_nanos: i64,
    state: Transaction,
    intents: Vec<(Key, Key)>,
    wrote: bool,
    heartbeat_stop: Option<watch::Sender<bool>>,
}

impl Txn {
    fn new(
        sender: Arc<dyn KvSender>,
        clock: Arc<Clock>,
        heartbeat_timeout_nanos: i64,
        state: Transaction,
    ) -> Self {
        Self {
            sender,
            clock,
            heartbeat_timeout_nanos,
            state,
            intents: Vec::new(),
            wrote: false,
            heartbeat_stop: None,
        }
    }

    /// The coordinator's current view of the transaction.
    pub fn state(&self) -> &Transaction {
        &self.state
    }

    /// Read a key at the transaction's snapshot.
    pub async fn get(&mut self, key: &[u8]) -> Result<Option<Value>> {
        let response = self
            .send(Request::Get(GetRequest {
                header: RequestHeader::point(key.to_vec()),
            }))
            .await?;
        match response {
            Response::Get(resp) => Ok(resp.value),
            other => Err(unexpected(other)),
        }
    }

    /// Scan `[start, end)` at the transaction's snapshot.
    pub async fn scan(
        &mut self,
        start: &[u8],
        end: &[u8],
        max: u64,
    ) -> Result<Vec<crate::api::data::KeyValue>> {
        let response = self
            .send(Request::Scan(ScanRequest {
                header: RequestHeader::span(start.to_vec(), end.to_vec()),
                max_results: max,
            }))
            .await?;
        match response {
            Response::Scan(resp) => Ok(resp.rows),
            other => Err(unexpected(other)),
        }
    }

    /// Write a provisional value.
    pub async fn put(&mut self, key: &[u8], value: Value) -> Result<()> {
        self.send(Request::Put(PutRequest {
            header: RequestHeader::point(key.to_vec()),
            value,
        }))
        .await
        .map(|_| ())
    }

    /// Write a provisional tombstone.
    pub async fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.send(Request::Delete(DeleteRequest {
            header: RequestHeader::point(key.to_vec()),
        }))
        .await
        .map(|_| ())
    }

    /// Add `delta` to an integer key, returning the new value.
    pub async fn increment(&mut self, key: &[u8], delta: i64) -> Result<i64> {
        let response = self
            .send(Request::Increment(IncrementRequest {
                header: RequestHeader::point(key.to_vec()),
                increment: delta,
            }))
            .await?;
        match response {
            Response::Increment(resp) => Ok(resp.new_value),
            other => Err(unexpected(other)),
        }
    }

    /// Send an arbitrary request inside this transaction.
    pub async fn send(&mut self, mut request: Request) -> Result<Response> {
        // Only data writes leave intents behind; protocol requests
        // (heartbeat, end) write the record, not intents.
        let leaves_intents = matches!(
            request.method(),
            Method::Put
                | Method::ConditionalPut
                | Method::Increment
                | Method::Delete
                | Method::DeleteRange
                | Method::Batch
        );
        if leaves_intents && !self.wrote {
            self.begin().await?;
        }

        request.header_mut().txn = Some(self.state.clone());
        let result = self.sender.send(request.clone()).await;
        match result {
            Ok(response) => {
                if let Some(updated) = &response.header().txn {
                    self.state.update(updated);
                }
                if leaves_intents {
                    let h = request.header();
                    self.intents.push((h.key.clone(), h.end_key.clone()));
                }
                Ok(response)
            }
            Err(e) => {
                if let Some(updated) = e.transaction() {
                    if updated.id == self.state.id {
                        self.state.update(updated);
                    }
                }
                Err(e)
            }
        }
    }

    /// Create the transaction record and start the heartbeat task.
    ///
    /// The record lives at the key derived from the transaction id hash;
    /// the heartbeat both creates it (the "begin" write) and keeps
    /// pushers from treating the transaction as abandoned.
    async fn begin(&mut self) -> Result<()> {
        self.wrote = true;
        self.heartbeat_once().await?;

        let (stop_tx, mut stop_rx) = watch::channel(false);
        self.heartbeat_stop = Some(stop_tx);
        let sender = self.sender.clone();
        let clock = self.clock.clone();
        let state = self.state.clone();
        let interval =
            std::time::Duration::from_nanos((self.heartbeat_timeout_nanos / 5).max(1) as u64);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let request = heartbeat_request(&state, clock.now());
                match sender.send(request).await {
                    Ok(response) => {
                        if let Some(txn) = &response.header().txn {
                            if txn.status.is_terminal() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        debug!(txn = %state.id, error = %e, "heartbeat failed");
                        if e.transaction_restart() != TransactionRestart::None {
                            return;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn heartbeat_once(&mut self) -> Result<()> {
        let request = heartbeat_request(&self.state, self.clock.now());
        let response = self.sender.send(request).await?;
        if let Some(updated) = &response.header().txn {
            self.state.update(updated);
        }
        Ok(())
    }

    fn stop_heartbeat(&mut self) {
        if let Some(stop) = self.heartbeat_stop.take() {
            let _ = stop.send(true);
        }
    }

    /// Commit the transaction and kick off asynchronous intent
    /// resolution.
    pub async fn commit(&mut self) -> Result<()> {
        self.stop_heartbeat();
        if !self.wrote {
            // Read-only transactions have no record to flip.
            return Ok(());
        }
        let committed = self.end(true).await?;
        self.resolve_async(committed);
        Ok(())
    }

    /// Abort the transaction. Errors are reported but non-fatal: intents
    /// of an abandoned transaction are resolved lazily by future readers.
    pub async fn rollback(&mut self) -> Result<()> {
        self.stop_heartbeat();
        if !self.wrote {
            return Ok(());
        }
        match self.end(false).await {
            Ok(aborted) => {
                self.resolve_async(aborted);
                Ok(())
            }
            Err(Error::TransactionAborted { .. }) => Ok(()),
            Err(e) => {
                warn!(txn = %self.state.id, error = %e, "rollback failed");
                Err(e)
            }
        }
    }

    async fn end(&mut self, commit: bool) -> Result<Transaction> {
        let intents: Vec<Intent> = self
            .intents
            .iter()
            .map(|(key, end_key)| Intent {
                key: key.clone(),
                end_key: end_key.clone(),
                txn: self.state.clone(),
            })
            .collect();
        let response = self
            .send(Request::EndTransaction(EndTransactionRequest {
                header: RequestHeader::point(keys::transaction_key(self.state.id)),
                commit,
                intents,
            }))
            .await?;
        response
            .header()
            .txn
            .clone()
            .ok_or_else(|| Error::internal("end transaction returned no record"))
    }

    /// Fire-and-forget intent resolution across the written spans.
    fn resolve_async(&self, final_txn: Transaction) {
        let sender = self.sender.clone();
        let spans = self.intents.clone();
        tokio::spawn(async move {
            for (key, end_key) in spans {
                let request = Request::InternalResolveIntent(InternalResolveIntentRequest {
                    header: RequestHeader {
                        key,
                        end_key,
                        ..Default::default()
                    },
                    intent_txn: final_txn.clone(),
                });
                if let Err(e) = sender.send(request).await {
                    // Resolution is idempotent and lazy: the next reader
                    // to trip over the intent finishes the job.
                    debug!(txn = %final_txn.id, error = %e, "async intent resolution failed");
                }
            }
        });
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

fn heartbeat_request(state: &Transaction, now: crate::core::clock::Timestamp) -> Request {
    let mut header = RequestHeader::point(keys::transaction_key(state.id));
    header.txn = Some(state.clone());
    Request::InternalHeartbeatTxn(InternalHeartbeatTxnRequest { header, now })
}

fn unexpected(response: Response) -> Error {
    Error::internal(format!("unexpected response kind {}", response.method()))
}

/// Run `body` inside a transaction, retrying per the restart policy until
/// it commits or fails with a non-restartable error.
pub async fn run_transaction<F>(
    sender: Arc<dyn KvSender>,
    clock: Arc<Clock>,
    heartbeat_timeout_nanos: i64,
    opts: TxnOptions,
    mut body: F,
) -> Result<()>
where
    F: for<'t> FnMut(&'t mut Txn) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 't>>,
{
    let max_offset = clock.max_offset_nanos();
    let mut state = Transaction::new(&opts.name, opts.isolation, clock.now(), max_offset);
    let mut backoff = Backoff::new(RetryOptions::default());

    loop {
        let mut txn = Txn::new(
            sender.clone(),
            clock.clone(),
            heartbeat_timeout_nanos,
            state.clone(),
        );
        let attempt = match body(&mut txn).await {
            Ok(()) => txn.commit().await,
            Err(e) => {
                let _ = txn.rollback().await;
                Err(e)
            }
        };
        let err = match attempt {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        let restart = err.transaction_restart();
        if restart == TransactionRestart::None {
            return Err(err);
        }
        debug!(txn = %state.id, error = %err, "restarting transaction");

        // Fold the authoritative view from the error into our state
        // before deciding how to come back.
        state = txn.state().clone();
        if let Some(updated) = err.transaction() {
            if updated.id == state.id {
                state.update(updated);
            }
        }

        let mut up_to = state.timestamp;
        if let Error::ReadWithinUncertaintyInterval {
            existing_timestamp, ..
        } = &err
        {
            // Come back reading above the uncertain write.
            let bumped = existing_timestamp.next();
            if bumped > up_to {
                up_to = bumped;
            }
        }

        if matches!(err, Error::TransactionAborted { .. }) || state.status == TxnStatus::Aborted {
            // The record is terminally aborted; only a fresh identity can
            // continue. The priority ratchet survives the rebirth.
            let priority = state.priority;
            state = Transaction::new(&opts.name, opts.isolation, clock.now(), max_offset);
            state.upgrade_priority(priority);
        } else {
            state.restart(state.priority, up_to, max_offset);
        }

        if restart == TransactionRestart::Backoff {
            if let Some(delay) = backoff.next_backoff() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}
