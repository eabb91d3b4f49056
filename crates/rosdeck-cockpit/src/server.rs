//! [`CockpitServer`] – HTTP + WebSocket surface for the dashboard.
//!
//! * `GET /ws` streams `{type, data}` envelopes to a viewer, starting with
//!   the retained last-known state.
//! * `/api/dialog/*` drives the [`DialogCorrelator`](rosdeck_dialog::DialogCorrelator).
//! * `POST /api/robot/command` forwards to the robot command service.
//! * `GET /health` reports bridge state.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        rejection::JsonRejection,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use rosdeck_dialog::LocalQuestion;
use rosdeck_types::{DeckError, RobotCommandReply};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::context::BridgeContext;

/// Default TCP port for the HTTP/WebSocket server.
pub const DEFAULT_PORT: u16 = 8080;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A [`DeckError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub DeckError);

impl From<DeckError> for ApiError {
    fn from(e: DeckError) -> Self {
        Self(e)
    }
}

/// Unreadable request bodies answer in the same envelope as every other
/// failure.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(DeckError::MalformedPayload(rejection.body_text()))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            DeckError::NotFound(_) => StatusCode::NOT_FOUND,
            DeckError::TransportUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            DeckError::RemoteFault(_) => StatusCode::BAD_GATEWAY,
            DeckError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            DeckError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            DeckError::Serialization(_) | DeckError::Channel(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(%status, error = %self.0, "request failed");
        } else {
            debug!(%status, error = %self.0, "request rejected");
        }
        (
            status,
            Json(OpResponse {
                success: false,
                error: Some(self.0.to_string()),
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
struct OpResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl OpResponse {
    fn ok() -> Json<Self> {
        Json(Self {
            success: true,
            error: None,
        })
    }
}

// ---------------------------------------------------------------------------
// CockpitServer
// ---------------------------------------------------------------------------

pub struct CockpitServer {
    ctx: Arc<BridgeContext>,
    port: u16,
}

impl CockpitServer {
    /// Create a server for `ctx` on the [`DEFAULT_PORT`].
    pub fn new(ctx: Arc<BridgeContext>) -> Self {
        Self {
            ctx,
            port: DEFAULT_PORT,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn router(&self) -> Router {
        router(Arc::clone(&self.ctx))
    }

    /// Bind `0.0.0.0:<port>` and serve until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// [`DeckError::Channel`] if the listener cannot bind or the server
    /// fails.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<(), DeckError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DeckError::Channel(format!("bind error on {addr}: {e}")))?;
        info!(%addr, "cockpit listening");
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), DeckError> {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| DeckError::Channel(format!("server error: {e}")))
    }
}

/// Build the full route table over `ctx`.
pub fn router(ctx: Arc<BridgeContext>) -> Router {
    Router::new()
        .route("/ws", get(viewer_socket))
        .route("/health", get(health))
        .route("/api/dialog/requests", get(list_requests).post(create_request))
        .route("/api/dialog/requests/{id}", get(get_request).delete(cancel_request))
        .route("/api/dialog/responses", post(answer_request))
        .route("/api/robot/command", post(robot_command))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

// ---------------------------------------------------------------------------
// Viewer socket
// ---------------------------------------------------------------------------

async fn viewer_socket(State(ctx): State<Arc<BridgeContext>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_viewer(socket, ctx))
}

async fn handle_viewer(socket: WebSocket, ctx: Arc<BridgeContext>) {
    let (viewer, mut outbound) = ctx.hub.join();
    let replayed = ctx.hub.replay_last_known(&viewer);
    debug!(viewer = %viewer.id(), replayed, "viewer caught up");

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            // ── Downstream: hub → browser ───────────────────────────────────
            next = outbound.recv() => {
                let Some(text) = next else { break };
                if ws_tx.send(Message::Text(text.to_string().into())).await.is_err() {
                    break;
                }
            }
            // ── Upstream: only close and errors matter ─────────────────────
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(viewer = %viewer.id(), error = %e, "viewer socket error");
                        break;
                    }
                }
            }
        }
    }

    ctx.hub.leave(viewer.id());
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health(State(ctx): State<Arc<BridgeContext>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "broker": {
            "url": ctx.transport.url(),
            "state": ctx.transport.state().to_string(),
            "retry_pending": ctx.transport.retry_pending(),
        },
        "subscriptions": ctx.registry.channels(),
        "viewers": ctx.hub.viewer_count(),
        "pending_dialogs": ctx.correlator.pending_count(),
    }))
}

// ---------------------------------------------------------------------------
// Dialog REST
// ---------------------------------------------------------------------------

async fn list_requests(State(ctx): State<Arc<BridgeContext>>) -> impl IntoResponse {
    Json(ctx.correlator.list_pending())
}

async fn create_request(
    State(ctx): State<Arc<BridgeContext>>,
    payload: Result<Json<LocalQuestion>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(local) = payload?;
    let request = ctx.correlator.create_local(local)?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn get_request(
    State(ctx): State<Arc<BridgeContext>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.correlator
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError(DeckError::NotFound(id)))
}

async fn cancel_request(
    State(ctx): State<Arc<BridgeContext>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.correlator.cancel(&id)?;
    Ok(OpResponse::ok())
}

#[derive(Debug, Deserialize)]
struct AnswerBody {
    request_id: String,
    #[serde(default)]
    response: Value,
}

async fn answer_request(
    State(ctx): State<Arc<BridgeContext>>,
    payload: Result<Json<AnswerBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = payload?;
    ctx.correlator.answer(&body.request_id, body.response)?;
    Ok(OpResponse::ok())
}

// ---------------------------------------------------------------------------
// Robot command
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CommandBody {
    cmd: i32,
    #[serde(default)]
    msg: String,
}

async fn robot_command(
    State(ctx): State<Arc<BridgeContext>>,
    payload: Result<Json<CommandBody>, JsonRejection>,
) -> Result<Json<RobotCommandReply>, ApiError> {
    let Json(body) = payload?;
    info!(cmd = body.cmd, "robot command requested");
    let reply = ctx
        .invoker
        .send_robot_command(body.cmd, body.msg, ctx.command_timeout())
        .await?;
    Ok(Json(reply))
}
