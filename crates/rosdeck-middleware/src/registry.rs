//! Idempotent per-channel subscriptions.
//!
//! Dozens of feature modules subscribe to robot topics from their own
//! on-connect hooks, and those hooks can overlap. The registry is the single
//! choke point that guarantees at most one live subscription per channel per
//! connection lifetime, and the single place inbound messages are dispatched
//! from.
//!
//! On every transport close the registry forgets all of its entries; the
//! feature modules re-create them from their on-connect hooks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rosdeck_types::DeckError;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::OutboundFrame;
use crate::transport::{FrameListener, Observer, TransportConnection};

/// Callback invoked synchronously for each inbound message on a channel.
///
/// Handlers run on the transport's read task and must return promptly.
pub type MessageHandler = dyn Fn(&Value) + Send + Sync;

/// One live subscription to a broker topic.
pub struct Subscription {
    id: String,
    channel: String,
    message_type: String,
    throttle_rate: Option<u32>,
    active: AtomicBool,
    handler: Arc<MessageHandler>,
}

impl Subscription {
    /// The rosbridge subscription id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// ROS message type the channel carries, e.g. `nav_msgs/msg/Odometry`.
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn throttle_rate(&self) -> Option<u32> {
        self.throttle_rate
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("message_type", &self.message_type)
            .field("throttle_rate", &self.throttle_rate)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Options for [`ChannelSubscriptionRegistry::ensure_subscribed`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Minimum interval between messages, in milliseconds, enforced by the
    /// broker.
    pub throttle_rate: Option<u32>,
    pub queue_length: Option<u32>,
}

/// Tracks every channel subscription of the current connection lifetime.
pub struct ChannelSubscriptionRegistry {
    transport: Arc<TransportConnection>,
    entries: Mutex<HashMap<String, Arc<Subscription>>>,
}

impl ChannelSubscriptionRegistry {
    /// Create a registry bound to `transport` and wire it in: the registry
    /// becomes the transport's inbound listener and tears itself down on
    /// every close.
    pub fn attach(transport: Arc<TransportConnection>) -> Arc<Self> {
        let registry = Arc::new(Self {
            transport: Arc::clone(&transport),
            entries: Mutex::new(HashMap::new()),
        });

        let listener: Weak<dyn FrameListener> = Arc::downgrade(&registry) as Weak<dyn FrameListener>;
        transport.set_listener(listener);

        let weak = Arc::downgrade(&registry);
        let teardown: Arc<Observer> = Arc::new(move |_: &TransportConnection| {
            if let Some(registry) = weak.upgrade() {
                registry.teardown_all();
            }
            Ok(())
        });
        transport.on_close(teardown);

        registry
    }

    /// Subscribe to `channel` unless a subscription is already tracked for
    /// it, in which case the existing one is returned untouched.
    ///
    /// # Errors
    ///
    /// [`DeckError::TransportUnavailable`] when there is no live connection;
    /// nothing is tracked in that case.
    pub fn ensure_subscribed(
        &self,
        channel: &str,
        message_type: &str,
        handler: Arc<MessageHandler>,
    ) -> Result<Arc<Subscription>, DeckError> {
        self.ensure_subscribed_with(channel, message_type, SubscribeOptions::default(), handler)
    }

    /// [`ensure_subscribed`](Self::ensure_subscribed) with broker-side
    /// throttling options.
    pub fn ensure_subscribed_with(
        &self,
        channel: &str,
        message_type: &str,
        options: SubscribeOptions,
        handler: Arc<MessageHandler>,
    ) -> Result<Arc<Subscription>, DeckError> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(channel) {
            debug!(channel, "subscription already tracked");
            return Ok(Arc::clone(existing));
        }

        let subscription = Arc::new(Subscription {
            id: format!("subscribe:{channel}:{}", Uuid::new_v4()),
            channel: channel.to_string(),
            message_type: message_type.to_string(),
            throttle_rate: options.throttle_rate,
            active: AtomicBool::new(true),
            handler,
        });

        self.transport.send_frame(&OutboundFrame::Subscribe {
            id: &subscription.id,
            topic: channel,
            message_type,
            throttle_rate: options.throttle_rate,
            queue_length: options.queue_length,
        })?;

        entries.insert(channel.to_string(), Arc::clone(&subscription));
        info!(channel, message_type, "subscribed");
        Ok(subscription)
    }

    /// Unsubscribe from `channel` and forget it. Returns `false` when the
    /// channel was not tracked.
    pub fn teardown(&self, channel: &str) -> bool {
        let Some(subscription) = self.entries.lock().remove(channel) else {
            return false;
        };
        subscription.deactivate();

        if self.transport.is_connected()
            && let Err(e) = self.transport.send_frame(&OutboundFrame::Unsubscribe {
                id: &subscription.id,
                topic: channel,
            })
        {
            warn!(channel, error = %e, "unsubscribe frame not sent");
        }
        debug!(channel, "subscription torn down");
        true
    }

    /// Forget every subscription. Run from the transport's on-close hook so
    /// the next connection starts clean.
    pub fn teardown_all(&self) {
        let drained: Vec<Arc<Subscription>> = self.entries.lock().drain().map(|(_, s)| s).collect();
        for subscription in &drained {
            subscription.deactivate();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "all subscriptions torn down");
        }
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.entries.lock().contains_key(channel)
    }

    /// Currently tracked channel names, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.entries.lock().keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Deliver `msg` to the handler of `channel`, if any.
    pub fn dispatch(&self, channel: &str, msg: &Value) -> bool {
        let subscription = self.entries.lock().get(channel).cloned();
        match subscription {
            Some(subscription) if subscription.is_active() => {
                (subscription.handler)(msg);
                true
            }
            _ => {
                debug!(channel, "message for untracked channel dropped");
                false
            }
        }
    }
}

impl FrameListener for ChannelSubscriptionRegistry {
    fn on_message(&self, topic: &str, msg: Value) {
        self.dispatch(topic, &msg);
    }
}
