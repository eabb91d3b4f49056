//! [`TransportConnection`] – the single, lazily reconnecting link to the
//! robot's rosbridge server.
//!
//! Exactly one connection attempt or live socket exists at any time, guarded
//! by the connection state and a single in-flight retry timer. Feature code
//! never reconnects by itself: it registers durable on-connect / on-close
//! observers and lets the transport drive them.
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──open──▶ Connected
//!      ▲                          │                    │
//!      └──── retry timer ◀── failed attempt     close ─┘
//! ```
//!
//! Retries use a fixed interval rather than exponential backoff: the broker
//! runs on the robot itself and comes back quickly.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rosdeck_types::{ConnectionState, DeckError};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::protocol::{InboundFrame, OutboundFrame};

/// Default delay between reconnection attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(3);

type RosbridgeStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callback run when the transport opens or closes.
///
/// Returning `Err` (or panicking) is logged and does not prevent the
/// remaining observers from running.
pub type Observer = dyn Fn(&TransportConnection) -> Result<(), DeckError> + Send + Sync;

/// Identifies a registered observer for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Receives every inbound topic message, in transport emission order.
pub trait FrameListener: Send + Sync {
    fn on_message(&self, topic: &str, msg: Value);
}

/// Anything that can publish a message on a named topic.
///
/// Implemented by [`TransportConnection`]; the dialog correlator depends on
/// this seam rather than the concrete transport.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, msg: &Value) -> Result<(), DeckError>;
}

// ---------------------------------------------------------------------------
// Observer list
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ObserverList {
    next_id: u64,
    entries: Vec<(ObserverId, Arc<Observer>)>,
}

impl ObserverList {
    /// Register `observer`, or return the existing id if the very same
    /// callback is already registered.
    fn add(&mut self, observer: Arc<Observer>) -> ObserverId {
        if let Some((id, _)) = self.entries.iter().find(|(_, o)| Arc::ptr_eq(o, &observer)) {
            return *id;
        }
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.entries.push((id, observer));
        id
    }

    fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(existing, _)| *existing != id);
        self.entries.len() != before
    }

    fn snapshot(&self) -> Vec<Arc<Observer>> {
        self.entries.iter().map(|(_, o)| Arc::clone(o)).collect()
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Reply to a `call_service` frame.
#[derive(Debug, Clone)]
pub struct ServiceReply {
    pub values: Value,
    pub result: bool,
}

/// Correlates outstanding service calls with their replies.
#[derive(Clone, Default)]
pub(crate) struct CallTable {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<ServiceReply>>>>,
}

impl CallTable {
    fn register(&self, id: String) -> oneshot::Receiver<ServiceReply> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        rx
    }

    pub(crate) fn forget(&self, id: &str) {
        self.pending.lock().remove(id);
    }

    fn resolve(&self, id: &str, reply: ServiceReply) {
        match self.pending.lock().remove(id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(id, "service response with no pending call"),
        }
    }

    /// Drop every pending sender so waiting callers observe the close.
    fn clear(&self) {
        self.pending.lock().clear();
    }

    fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

enum Outbound {
    Frame(String),
    Close,
}

/// Cheap, cloneable reference to one live socket.
///
/// A handle belongs to exactly one connection lifetime; once that socket
/// closes every send through the handle fails with
/// [`DeckError::TransportUnavailable`].
#[derive(Clone)]
pub struct TransportHandle {
    generation: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    calls: CallTable,
}

impl TransportHandle {
    /// Connection lifetime this handle belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn send(&self, frame: &OutboundFrame<'_>) -> Result<(), DeckError> {
        let text = frame.encode()?;
        self.outbound
            .send(Outbound::Frame(text))
            .map_err(|_| DeckError::TransportUnavailable)
    }

    pub(crate) fn register_call(&self, id: String) -> oneshot::Receiver<ServiceReply> {
        self.calls.register(id)
    }

    pub(crate) fn forget_call(&self, id: &str) {
        self.calls.forget(id);
    }

    /// The call table of this socket, detached from its outbound sender.
    pub(crate) fn call_table(&self) -> CallTable {
        self.calls.clone()
    }

    /// Number of service calls awaiting a reply on this socket.
    pub fn pending_calls(&self) -> usize {
        self.calls.len()
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

// ---------------------------------------------------------------------------
// TransportConnection
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    handle: Option<TransportHandle>,
    retry: Option<JoinHandle<()>>,
    generation: u64,
    shut_down: bool,
}

/// Owner of the single connection to the rosbridge broker.
pub struct TransportConnection {
    url: String,
    retry_interval: Duration,
    inner: Mutex<Inner>,
    on_connect: Mutex<ObserverList>,
    on_close: Mutex<ObserverList>,
    listener: Mutex<Option<Weak<dyn FrameListener>>>,
}

impl TransportConnection {
    /// Create a disconnected transport for the broker at `url`
    /// (e.g. `ws://localhost:9090`). Nothing happens until [`connect`] is
    /// called.
    ///
    /// [`connect`]: TransportConnection::connect
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            inner: Mutex::new(Inner::default()),
            on_connect: Mutex::new(ObserverList::default()),
            on_close: Mutex::new(ObserverList::default()),
            listener: Mutex::new(None),
        }
    }

    /// Override the fixed reconnection interval (builder-style).
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The live socket handle, if connected.
    pub fn handle(&self) -> Option<TransportHandle> {
        self.inner.lock().handle.clone()
    }

    /// Whether a reconnection timer is currently outstanding.
    pub fn retry_pending(&self) -> bool {
        self.inner
            .lock()
            .retry
            .as_ref()
            .is_some_and(|retry| !retry.is_finished())
    }

    /// Register a durable observer run after every successful (re)connect,
    /// in registration order. Registering the same callback twice is a
    /// no-op returning the original id.
    pub fn on_connect(&self, observer: Arc<Observer>) -> ObserverId {
        self.on_connect.lock().add(observer)
    }

    /// Register a durable observer run after every close.
    pub fn on_close(&self, observer: Arc<Observer>) -> ObserverId {
        self.on_close.lock().add(observer)
    }

    /// Remove an observer from whichever list holds it.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.on_connect.lock().remove(id) || self.on_close.lock().remove(id)
    }

    /// Route inbound topic messages to `listener`. Only a weak reference is
    /// kept so the listener may own the transport.
    pub fn set_listener(&self, listener: Weak<dyn FrameListener>) {
        *self.listener.lock() = Some(listener);
    }

    /// Start connecting unless an attempt is already pending, a retry timer
    /// is armed, or a socket is already open.
    pub fn connect(self: &Arc<Self>) {
        let generation = {
            let mut inner = self.inner.lock();
            if inner.shut_down
                || inner.state != ConnectionState::Disconnected
                || inner.retry.as_ref().is_some_and(|r| !r.is_finished())
            {
                return;
            }
            inner.state = ConnectionState::Connecting;
            inner.generation += 1;
            inner.generation
        };

        debug!(url = %self.url, generation, "connecting to rosbridge");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match connect_async(this.url.as_str()).await {
                Ok((stream, _)) => this.handle_open(generation, stream),
                Err(e) => {
                    warn!(url = %this.url, error = %e, "rosbridge connection attempt failed");
                    this.handle_failed_attempt(generation);
                }
            }
        });
    }

    /// Send a frame on the live socket.
    pub fn send_frame(&self, frame: &OutboundFrame<'_>) -> Result<(), DeckError> {
        self.handle()
            .ok_or(DeckError::TransportUnavailable)?
            .send(frame)
    }

    /// Declare that this bridge will publish `message_type` on `topic`.
    pub fn advertise(&self, topic: &str, message_type: &str) -> Result<(), DeckError> {
        self.send_frame(&OutboundFrame::Advertise {
            topic,
            message_type,
        })
    }

    /// Close the socket, cancel any retry timer and never reconnect again.
    pub fn shutdown(&self) {
        let handle = {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            inner.state = ConnectionState::Disconnected;
            if let Some(retry) = inner.retry.take() {
                retry.abort();
            }
            inner.handle.take()
        };
        if let Some(handle) = handle {
            handle.close();
            let observers = self.on_close.lock().snapshot();
            self.notify(observers, "close");
        }
        info!(url = %self.url, "transport shut down");
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    fn handle_open(self: &Arc<Self>, generation: u64, stream: RosbridgeStream) {
        let (sink, source) = stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let calls = CallTable::default();
        let handle = TransportHandle {
            generation,
            outbound: tx,
            calls: calls.clone(),
        };

        {
            let mut inner = self.inner.lock();
            if inner.shut_down || inner.generation != generation {
                debug!(generation, "discarding stale rosbridge socket");
                return;
            }
            inner.state = ConnectionState::Connected;
            inner.handle = Some(handle);
            if let Some(retry) = inner.retry.take() {
                retry.abort();
            }
        }

        tokio::spawn(write_loop(sink, rx));
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.read_loop(source, &calls).await;
            calls.clear();
            this.handle_closed(generation);
        });

        info!(url = %self.url, generation, "rosbridge connected");
        let observers = self.on_connect.lock().snapshot();
        self.notify(observers, "connect");
    }

    fn handle_closed(self: &Arc<Self>, generation: u64) {
        {
            let mut inner = self.inner.lock();
            if inner.shut_down
                || inner.generation != generation
                || inner.state != ConnectionState::Connected
            {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            inner.handle = None;
        }

        warn!(url = %self.url, generation, "rosbridge connection closed");
        let observers = self.on_close.lock().snapshot();
        self.notify(observers, "close");
        self.schedule_retry();
    }

    fn handle_failed_attempt(self: &Arc<Self>, generation: u64) {
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state != ConnectionState::Connecting {
                return;
            }
            inner.state = ConnectionState::Disconnected;
        }
        self.schedule_retry();
    }

    fn schedule_retry(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.shut_down || inner.retry.as_ref().is_some_and(|r| !r.is_finished()) {
            return;
        }

        let delay = self.retry_interval;
        let weak = Arc::downgrade(self);
        debug!(delay_ms = delay.as_millis() as u64, "scheduling rosbridge reconnect");
        inner.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(this) = weak.upgrade() {
                this.inner.lock().retry = None;
                this.connect();
            }
        }));
    }

    fn notify(&self, observers: Vec<Arc<Observer>>, phase: &'static str) {
        for (index, observer) in observers.iter().enumerate() {
            match std::panic::catch_unwind(AssertUnwindSafe(|| observer(self))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(phase, index, error = %e, "transport observer failed"),
                Err(_) => error!(phase, index, "transport observer panicked"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound routing
    // -----------------------------------------------------------------------

    async fn read_loop(&self, mut source: SplitStream<RosbridgeStream>, calls: &CallTable) {
        while let Some(msg) = source.next().await {
            match msg {
                Ok(Message::Text(text)) => self.route_inbound(text.as_str(), calls),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "rosbridge read error");
                    break;
                }
            }
        }
    }

    fn route_inbound(&self, text: &str, calls: &CallTable) {
        match InboundFrame::decode(text) {
            Ok(InboundFrame::Publish { topic, msg }) => {
                let listener = self.listener.lock().as_ref().and_then(Weak::upgrade);
                match listener {
                    Some(listener) => listener.on_message(&topic, msg),
                    None => debug!(topic, "no listener for inbound message"),
                }
            }
            Ok(InboundFrame::ServiceResponse {
                id,
                service,
                values,
                result,
            }) => match id {
                Some(id) => calls.resolve(&id, ServiceReply { values, result }),
                None => warn!(service, "service response without id"),
            },
            Ok(InboundFrame::Status { level, msg }) => {
                if level == "error" {
                    warn!(level, msg, "rosbridge status");
                } else {
                    debug!(level, msg, "rosbridge status");
                }
            }
            Ok(InboundFrame::Other) => debug!("ignoring unsupported rosbridge op"),
            Err(e) => warn!(error = %e, "undecodable rosbridge frame"),
        }
    }
}

impl Publisher for TransportConnection {
    fn publish(&self, topic: &str, msg: &Value) -> Result<(), DeckError> {
        self.send_frame(&OutboundFrame::Publish { topic, msg })
    }
}

async fn write_loop(
    mut sink: SplitSink<RosbridgeStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame(text) => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!(error = %e, "rosbridge write error");
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = sink.close().await;
}
