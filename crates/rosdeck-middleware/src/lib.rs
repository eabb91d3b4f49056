//! `rosdeck-middleware` – the link between the robot's rosbridge server and
//! the dashboard viewers.
//!
//! # Modules
//!
//! - [`transport`] – the single, lazily reconnecting rosbridge connection
//!   with durable on-connect / on-close observers.
//! - [`service`] – correlated service calls over the transport.
//! - [`registry`] – idempotent per-channel subscriptions and inbound
//!   dispatch.
//! - [`hub`] – fan-out of `{type, data}` envelopes to every live viewer.
//! - [`relays`] – robot topic to viewer event relays.
//! - [`views`] – collapsed transform and mission queue state.
//! - [`protocol`] – rosbridge v2 JSON frames.

pub mod hub;
pub mod protocol;
pub mod registry;
pub mod relays;
pub mod service;
pub mod transport;
pub mod views;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use hub::{BroadcastHub, ViewerConnection, ViewerReceiver};
pub use registry::{ChannelSubscriptionRegistry, MessageHandler, SubscribeOptions, Subscription};
pub use relays::{RELAYS, Relay, RelaySpec, install_relays};
pub use service::ServiceInvoker;
pub use transport::{
    DEFAULT_RETRY_INTERVAL, FrameListener, Observer, ObserverId, Publisher, TransportConnection,
    TransportHandle,
};
