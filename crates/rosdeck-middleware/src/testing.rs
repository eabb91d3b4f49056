//! In-process stand-in for a `rosbridge_server`, used by the workspace tests
//! (enable the `test-util` feature outside this crate).

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

type Responder = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// A fake broker accepting any number of sequential clients.
///
/// Every text frame a client sends is decoded and queued for
/// [`FakeRosbridge::next_frame`]. An optional responder answers
/// `call_service` frames.
pub struct FakeRosbridge {
    addr: SocketAddr,
    frames: mpsc::UnboundedReceiver<Value>,
    client: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    connections: Arc<AtomicUsize>,
    responder: Arc<Mutex<Option<Responder>>>,
}

impl FakeRosbridge {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake rosbridge");
        let addr = listener.local_addr().expect("local addr");
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let client: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>> = Arc::new(Mutex::new(None));
        let connections = Arc::new(AtomicUsize::new(0));
        let responder: Arc<Mutex<Option<Responder>>> = Arc::new(Mutex::new(None));

        {
            let client = Arc::clone(&client);
            let connections = Arc::clone(&connections);
            let responder = Arc::clone(&responder);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let Ok(ws) = accept_async(stream).await else {
                        continue;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);
                    let (mut ws_tx, mut ws_rx) = ws.split();
                    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
                    *client.lock() = Some(tx.clone());

                    tokio::spawn(async move {
                        while let Some(msg) = rx.recv().await {
                            let closing = matches!(msg, Message::Close(_));
                            if ws_tx.send(msg).await.is_err() || closing {
                                break;
                            }
                        }
                    });

                    let frames_tx = frames_tx.clone();
                    let responder = Arc::clone(&responder);
                    tokio::spawn(async move {
                        while let Some(Ok(msg)) = ws_rx.next().await {
                            let Message::Text(text) = msg else {
                                continue;
                            };
                            let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                                continue;
                            };
                            let responder = responder.lock().clone();
                            if frame["op"] == "call_service"
                                && let Some(responder) = responder
                                && let Some(reply) = responder(&frame)
                            {
                                let _ = tx.send(Message::Text(reply.to_string().into()));
                            }
                            let _ = frames_tx.send(frame);
                        }
                    });
                }
            });
        }

        Self {
            addr,
            frames,
            client,
            connections,
            responder,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Answer every `call_service` frame with `respond(frame)`; `None`
    /// leaves the call unanswered.
    pub fn respond_to_calls(
        &self,
        respond: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    ) {
        *self.responder.lock() = Some(Arc::new(respond));
    }

    /// Push a `publish` frame for `topic` to the current client.
    pub fn publish(&self, topic: &str, msg: Value) {
        self.push(json!({"op": "publish", "topic": topic, "msg": msg}));
    }

    pub fn push(&self, frame: Value) {
        if let Some(tx) = self.client.lock().as_ref() {
            let _ = tx.send(Message::Text(frame.to_string().into()));
        }
    }

    /// Close the current client connection from the server side.
    pub fn drop_client(&self) {
        if let Some(tx) = self.client.lock().take() {
            let _ = tx.send(Message::Close(None));
        }
    }

    /// Next frame sent by a client, failing the test after two seconds.
    pub async fn next_frame(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(2), self.frames.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("fake rosbridge stopped")
    }

    /// Next frame whose `op` equals `op`, skipping others.
    pub async fn next_op(&mut self, op: &str) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame["op"] == op {
                return frame;
            }
        }
    }
}

/// A `ws://` URL on a local port nothing listens on.
pub async fn unused_local_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind unused port");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("ws://{addr}")
}

/// Poll `condition` every 5 ms, failing the test after two seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
