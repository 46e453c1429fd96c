//! Node status channel.
//!
//! Storage faults inside an applying replica are unrecoverable: the
//! replica stops servicing and reports here. The node keeps serving from
//! its remaining healthy stores; operational tooling drains the channel.

use crate::api::data::{RangeId, StoreId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

/// An event on the node status channel.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    /// A replica stopped after an engine write failure.
    ReplicaDead {
        store_id: StoreId,
        range_id: RangeId,
        message: String,
    },
}

/// Collects status events for inspection by operational tooling.
pub struct StatusMonitor {
    tx: mpsc::UnboundedSender<StatusEvent>,
    rx: Mutex<mpsc::UnboundedReceiver<StatusEvent>>,
    dead_replicas: Mutex<Vec<(StoreId, RangeId)>>,
}

impl Default for StatusMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusMonitor {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            dead_replicas: Mutex::new(Vec::new()),
        }
    }

    /// The sender half, handed to stores.
    pub fn sender(&self) -> mpsc::UnboundedSender<StatusEvent> {
        self.tx.clone()
    }

    /// Drain pending events into the monitor's state, returning them.
    pub fn poll(&self) -> Vec<StatusEvent> {
        let mut rx = self.rx.lock();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match &event {
                StatusEvent::ReplicaDead {
                    store_id,
                    range_id,
                    message,
                } => {
                    warn!(store_id = %store_id, range_id = %range_id, message = %message, "replica reported dead");
                    self.dead_replicas.lock().push((*store_id, *range_id));
                }
            }
            events.push(event);
        }
        events
    }

    /// Replicas reported dead so far.
    pub fn dead_replicas(&self) -> Vec<(StoreId, RangeId)> {
        self.poll();
        self.dead_replicas.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_dead_replicas() {
        let monitor = StatusMonitor::new();
        let tx = monitor.sender();
        tx.send(StatusEvent::ReplicaDead {
            store_id: StoreId(1),
            range_id: RangeId(7),
            message: "injected".to_string(),
        })
        .unwrap();
        assert_eq!(monitor.dead_replicas(), vec![(StoreId(1), RangeId(7))]);
    }
}
