//! `rosdeck-cockpit` – the dashboard-facing server.
//!
//! Owns the [`BridgeContext`] (transport, invoker, subscription registry,
//! broadcast hub and dialog correlator, wired together once at startup) and
//! exposes it over HTTP:
//!
//! 1. **Streams** robot state to every connected viewer over `GET /ws`,
//!    replaying the last known map, status and dialog list on join.
//! 2. **Serves** the dialog REST API so operators and local tools can list,
//!    answer, create and cancel questions.
//! 3. **Forwards** robot commands to the `/robot/command` service.
//!
//! # Usage
//!
//! ```rust,no_run
//! use rosdeck_cockpit::{BridgeContext, BridgeSettings, CockpitServer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let ctx = BridgeContext::new(BridgeSettings::new("ws://localhost:9090"));
//!     ctx.start();
//!     CockpitServer::new(ctx)
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//!         .expect("cockpit server failed");
//! }
//! ```

pub mod context;
pub mod server;

pub use context::{BridgeContext, BridgeSettings, DEFAULT_COMMAND_TIMEOUT};
pub use server::{ApiError, CockpitServer, DEFAULT_PORT, router};
