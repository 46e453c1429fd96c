//! Process lifecycle and the stopper.
//!
//! Every long-lived worker subscribes to the stopper: a shutdown signal
//! both refuses new work and waits for in-flight work to complete, bounded
//! by a drain timeout. Request-scoped work registers through a guard so the
//! drain can count it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Coordinates shutdown across background workers and in-flight requests.
pub struct Stopper {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    stopping: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Stopper {
    pub fn new() -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            shutdown_tx,
            shutdown_rx,
            stopping: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// A receiver that flips to `true` when shutdown begins. Workers
    /// select on this alongside their work source.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Whether shutdown has begun.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Register a unit of request-scoped work.
    ///
    /// Returns `None` once shutdown has begun; the caller must refuse the
    /// request. The guard keeps the drain waiting until dropped.
    pub fn run_task(self: &Arc<Self>) -> Option<TaskGuard> {
        if self.is_stopping() {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        // Re-check after registering so a concurrent stop cannot miss us.
        if self.is_stopping() {
            self.finish_task();
            return None;
        }
        Some(TaskGuard {
            stopper: Arc::clone(self),
        })
    }

    fn finish_task(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Spawn a named background worker tracked for join at stop.
    pub fn spawn(
        self: &Arc<Self>,
        name: impl Into<String>,
        fut: impl std::future::Future<Output = ()> + Send + 'static,
    ) {
        let name = name.into();
        let handle = tokio::spawn(fut);
        self.tasks.lock().push((name, handle));
    }

    /// Begin shutdown: refuse new work, signal workers, and wait for
    /// in-flight work and workers to finish, bounded by `drain_timeout`.
    pub async fn stop(&self, drain_timeout: Duration) {
        self.stopping.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        let drain = async {
            while self.in_flight.load(Ordering::Acquire) > 0 {
                self.drained.notified().await;
            }
        };
        if tokio::time::timeout(drain_timeout, drain).await.is_err() {
            warn!(
                in_flight = self.in_flight.load(Ordering::Acquire),
                "drain timeout elapsed with work still in flight"
            );
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (name, handle) in tasks {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => debug!(task = %name, "worker stopped"),
                Ok(Err(e)) => warn!(task = %name, error = %e, "worker panicked"),
                Err(_) => warn!(task = %name, "worker did not stop within drain timeout"),
            }
        }
    }
}

/// Guard for one unit of in-flight work.
pub struct TaskGuard {
    stopper: Arc<Stopper>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.stopper.finish_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refuses_work_after_stop() {
        let stopper = Stopper::new();
        assert!(stopper.run_task().is_some());
        stopper.stop(Duration::from_millis(100)).await;
        assert!(stopper.run_task().is_none());
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_work() {
        let stopper = Stopper::new();
        let guard = stopper.run_task().expect("not stopping");
        let stopper2 = Arc::clone(&stopper);
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        stopper2.stop(Duration::from_secs(1)).await;
        release.await.unwrap();
        assert!(stopper2.is_stopping());
    }

    #[tokio::test]
    async fn workers_observe_shutdown_signal() {
        let stopper = Stopper::new();
        let mut signal = stopper.shutdown_signal();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        stopper.spawn("worker", async move {
            let _ = signal.changed().await;
            let _ = done_tx.send(());
        });
        stopper.stop(Duration::from_secs(1)).await;
        done_rx.await.expect("worker saw shutdown");
    }
}
