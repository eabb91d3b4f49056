//! Fan-out of tagged events to every connected dashboard viewer.
//!
//! Each viewer owns an unbounded outbound queue drained by its socket task.
//! A broadcast serializes the `{"type", "data"}` envelope once and pushes the
//! same text to every viewer that is still open; closed viewers are skipped
//! without error. Delivery is best-effort and at-most-once.
//!
//! The outbound queues are unbounded: a stalled viewer grows its own queue
//! rather than slowing the others. At the expected scale (tens of viewers)
//! this is an accepted risk.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rosdeck_types::{DeckError, OutboundEnvelope};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// One live downstream viewer socket.
#[derive(Debug)]
pub struct ViewerConnection {
    id: Uuid,
    tx: mpsc::UnboundedSender<Arc<str>>,
    open: AtomicBool,
}

impl ViewerConnection {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    /// Mark the viewer closed; later broadcasts skip it.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn push(&self, text: &Arc<str>) -> bool {
        if !self.is_open() {
            return false;
        }
        if self.tx.send(Arc::clone(text)).is_err() {
            self.close();
            return false;
        }
        true
    }
}

/// Receiving end of a viewer's outbound queue.
pub type ViewerReceiver = mpsc::UnboundedReceiver<Arc<str>>;

/// Registry of live viewers plus the last retained envelope per kind.
#[derive(Default)]
pub struct BroadcastHub {
    viewers: Mutex<Vec<Arc<ViewerConnection>>>,
    retained: Mutex<HashMap<String, Arc<str>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new viewer. The returned receiver yields every envelope
    /// addressed to it, as JSON text.
    pub fn join(&self) -> (Arc<ViewerConnection>, ViewerReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let viewer = Arc::new(ViewerConnection {
            id: Uuid::new_v4(),
            tx,
            open: AtomicBool::new(true),
        });
        let count = {
            let mut viewers = self.viewers.lock();
            viewers.push(Arc::clone(&viewer));
            viewers.len()
        };
        info!(viewer = %viewer.id, count, "viewer joined");
        (viewer, rx)
    }

    /// Remove a viewer. Returns `false` if it was not registered.
    pub fn leave(&self, id: Uuid) -> bool {
        let mut viewers = self.viewers.lock();
        let Some(index) = viewers.iter().position(|v| v.id == id) else {
            return false;
        };
        let viewer = viewers.remove(index);
        viewer.close();
        info!(viewer = %id, count = viewers.len(), "viewer left");
        true
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.lock().len()
    }

    /// Push `{kind, payload}` to every open viewer. Returns how many viewers
    /// were handed the envelope.
    pub fn broadcast<T: Serialize + ?Sized>(&self, kind: &str, payload: &T) -> Result<usize, DeckError> {
        let text: Arc<str> = OutboundEnvelope::new(kind, payload).to_json()?.into();
        Ok(self.fan_out(kind, &text))
    }

    /// Like [`broadcast`](Self::broadcast), and also remember the envelope as
    /// the last-known state for `kind` so late joiners can be caught up.
    pub fn broadcast_retained<T: Serialize + ?Sized>(
        &self,
        kind: &str,
        payload: &T,
    ) -> Result<usize, DeckError> {
        let text: Arc<str> = OutboundEnvelope::new(kind, payload).to_json()?.into();
        self.retained.lock().insert(kind.to_string(), Arc::clone(&text));
        Ok(self.fan_out(kind, &text))
    }

    /// Send `{kind, payload}` to a single viewer.
    pub fn send_to<T: Serialize + ?Sized>(
        &self,
        viewer: &ViewerConnection,
        kind: &str,
        payload: &T,
    ) -> Result<bool, DeckError> {
        let text: Arc<str> = OutboundEnvelope::new(kind, payload).to_json()?.into();
        Ok(viewer.push(&text))
    }

    /// Replay every retained envelope to `viewer`, in kind order. Returns
    /// the number sent.
    pub fn replay_last_known(&self, viewer: &ViewerConnection) -> usize {
        let mut retained: Vec<(String, Arc<str>)> = self
            .retained
            .lock()
            .iter()
            .map(|(kind, text)| (kind.clone(), Arc::clone(text)))
            .collect();
        retained.sort_by(|a, b| a.0.cmp(&b.0));
        retained.iter().filter(|(_, text)| viewer.push(text)).count()
    }

    fn fan_out(&self, kind: &str, text: &Arc<str>) -> usize {
        // Snapshot so joins and leaves never interleave with the iteration.
        let viewers: Vec<Arc<ViewerConnection>> = self.viewers.lock().clone();
        let delivered = viewers.iter().filter(|viewer| viewer.push(text)).count();
        debug!(kind, delivered, total = viewers.len(), "broadcast");
        delivered
    }
}
