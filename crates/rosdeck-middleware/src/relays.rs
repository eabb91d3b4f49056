//! Robot topic relays.
//!
//! Each relay subscribes to one broker channel from a transport on-connect
//! hook and re-broadcasts every inbound message to dashboard viewers under a
//! fixed event kind. `/tf` and the mission queue channels are collapsed
//! through [`TfView`] and [`MissionQueueView`] first, so viewers only see
//! changes.

use std::sync::Arc;

use parking_lot::Mutex;
use rosdeck_types::{DeckError, channels, kinds};
use serde_json::Value;
use tracing::{debug, warn};

use crate::hub::BroadcastHub;
use crate::registry::{ChannelSubscriptionRegistry, MessageHandler, SubscribeOptions};
use crate::transport::{Observer, ObserverId, TransportConnection};
use crate::views::{MissionQueueView, TfView};

/// How inbound messages on a relay are filtered before broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collapse {
    /// Forward every message as-is.
    None,
    /// Merge into the transform view and broadcast the merged snapshot.
    Transforms,
    /// Drop events that repeat the last known state of their mission.
    Missions,
}

/// Static description of one channel-to-viewer relay.
#[derive(Debug, Clone, Copy)]
pub struct RelaySpec {
    pub channel: &'static str,
    pub message_type: &'static str,
    pub kind: &'static str,
    /// Keep the last envelope so late-joining viewers are caught up.
    pub retained: bool,
    pub throttle_rate: Option<u32>,
    pub collapse: Collapse,
}

/// Every relay the bridge installs.
pub const RELAYS: &[RelaySpec] = &[
    RelaySpec {
        channel: channels::MAP,
        message_type: "nav_msgs/msg/OccupancyGrid",
        kind: kinds::MAP_UPDATE,
        retained: true,
        throttle_rate: None,
        collapse: Collapse::None,
    },
    RelaySpec {
        channel: channels::TF,
        message_type: "tf2_msgs/msg/TFMessage",
        kind: kinds::ROBOT_TF,
        retained: true,
        throttle_rate: Some(100),
        collapse: Collapse::Transforms,
    },
    RelaySpec {
        channel: channels::SCAN,
        message_type: "sensor_msgs/msg/LaserScan",
        kind: kinds::SCAN_UPDATE,
        retained: false,
        throttle_rate: Some(100),
        collapse: Collapse::None,
    },
    RelaySpec {
        channel: channels::ODOM,
        message_type: "nav_msgs/msg/Odometry",
        kind: kinds::ODOM_UPDATE,
        retained: false,
        throttle_rate: Some(100),
        collapse: Collapse::None,
    },
    RelaySpec {
        channel: channels::BRAKE_STATUS,
        message_type: "std_msgs/msg/Bool",
        kind: kinds::BRAKE_UPDATE,
        retained: true,
        throttle_rate: None,
        collapse: Collapse::None,
    },
    RelaySpec {
        channel: channels::ROBOT_STATUS,
        message_type: "std_msgs/msg/String",
        kind: kinds::ROBOT_STATUS,
        retained: true,
        throttle_rate: None,
        collapse: Collapse::None,
    },
    RelaySpec {
        channel: channels::MAP_CHANGE,
        message_type: "std_msgs/msg/String",
        kind: kinds::MAP_CHANGE,
        retained: true,
        throttle_rate: None,
        collapse: Collapse::None,
    },
    RelaySpec {
        channel: channels::MISSION_ADDED,
        message_type: "std_msgs/msg/String",
        kind: kinds::MISSION_QUEUE_ADDED,
        retained: false,
        throttle_rate: None,
        collapse: Collapse::Missions,
    },
    RelaySpec {
        channel: channels::MISSION_STATUS,
        message_type: "std_msgs/msg/String",
        kind: kinds::MISSION_QUEUE_STATUS,
        retained: true,
        throttle_rate: None,
        collapse: Collapse::Missions,
    },
];

/// One installed relay with its collapse state.
pub struct Relay {
    spec: RelaySpec,
    hub: Arc<BroadcastHub>,
    transforms: Mutex<TfView>,
    missions: Mutex<MissionQueueView>,
}

impl Relay {
    pub fn new(spec: RelaySpec, hub: Arc<BroadcastHub>) -> Self {
        Self {
            spec,
            hub,
            transforms: Mutex::new(TfView::new()),
            missions: Mutex::new(MissionQueueView::new()),
        }
    }

    pub fn spec(&self) -> &RelaySpec {
        &self.spec
    }

    /// Handle one inbound message. Returns the number of viewers reached.
    pub fn handle(&self, msg: &Value) -> usize {
        let payload = match self.spec.collapse {
            Collapse::None => msg.clone(),
            Collapse::Transforms => {
                let mut view = self.transforms.lock();
                if !view.merge(msg) {
                    return 0;
                }
                view.snapshot()
            }
            Collapse::Missions => {
                if !self.missions.lock().apply(msg) {
                    debug!(channel = self.spec.channel, "duplicate mission event dropped");
                    return 0;
                }
                msg.clone()
            }
        };

        let result = if self.spec.retained {
            self.hub.broadcast_retained(self.spec.kind, &payload)
        } else {
            self.hub.broadcast(self.spec.kind, &payload)
        };
        match result {
            Ok(delivered) => delivered,
            Err(e) => {
                warn!(channel = self.spec.channel, error = %e, "relay broadcast failed");
                0
            }
        }
    }

    /// Drop collapse state carried over from a previous connection. A
    /// restarted robot may stamp transforms earlier than the ones held.
    pub fn reset(&self) {
        match self.spec.collapse {
            Collapse::None => {}
            Collapse::Transforms => self.transforms.lock().clear(),
            Collapse::Missions => self.missions.lock().clear(),
        }
    }

    /// Subscribe this relay's channel through `registry`.
    pub fn subscribe(self: &Arc<Self>, registry: &ChannelSubscriptionRegistry) -> Result<(), DeckError> {
        let relay = Arc::clone(self);
        let handler: Arc<MessageHandler> = Arc::new(move |msg: &Value| {
            relay.handle(msg);
        });
        registry.ensure_subscribed_with(
            self.spec.channel,
            self.spec.message_type,
            SubscribeOptions {
                throttle_rate: self.spec.throttle_rate,
                queue_length: None,
            },
            handler,
        )?;
        Ok(())
    }
}

/// Install every relay in [`RELAYS`]: each gets an on-connect observer that
/// resets its collapse state and (re)subscribes its channel. When the transport is already connected the
/// subscriptions are made immediately as well.
pub fn install_relays(
    transport: &TransportConnection,
    registry: &Arc<ChannelSubscriptionRegistry>,
    hub: &Arc<BroadcastHub>,
) -> Vec<ObserverId> {
    RELAYS
        .iter()
        .map(|spec| {
            let relay = Arc::new(Relay::new(*spec, Arc::clone(hub)));
            let weak_registry = Arc::downgrade(registry);
            let observer: Arc<Observer> = Arc::new(move |_: &TransportConnection| {
                relay.reset();
                match weak_registry.upgrade() {
                    Some(registry) => relay.subscribe(&registry),
                    None => Ok(()),
                }
            });
            if transport.is_connected()
                && let Err(e) = observer(transport)
            {
                warn!(channel = spec.channel, error = %e, "initial relay subscription failed");
            }
            transport.on_connect(observer)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::ViewerReceiver;
    use crate::testing::{FakeRosbridge, wait_until};
    use serde_json::json;
    use std::time::Duration;

    fn relay_for(channel: &str, hub: &Arc<BroadcastHub>) -> Relay {
        let spec = RELAYS
            .iter()
            .find(|s| s.channel == channel)
            .copied()
            .unwrap();
        Relay::new(spec, Arc::clone(hub))
    }

    async fn next_of_kind(rx: &mut ViewerReceiver, kind: &str) -> Value {
        loop {
            let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let envelope: Value = serde_json::from_str(&text).unwrap();
            if envelope["type"] == kind {
                return envelope;
            }
        }
    }

    #[test]
    fn relay_table_covers_each_channel_once() {
        let mut channels: Vec<&str> = RELAYS.iter().map(|s| s.channel).collect();
        channels.sort();
        channels.dedup();
        assert_eq!(channels.len(), RELAYS.len());
    }

    #[tokio::test]
    async fn odom_is_forwarded_verbatim() {
        let hub = Arc::new(BroadcastHub::new());
        let (_viewer, mut rx) = hub.join();
        let relay = relay_for(channels::ODOM, &hub);

        assert_eq!(relay.handle(&json!({"twist": {"linear": 0.3}})), 1);
        let envelope: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(envelope["type"], "odom_update");
        assert_eq!(envelope["data"]["twist"]["linear"], 0.3);
    }

    #[tokio::test]
    async fn stale_transform_is_not_rebroadcast() {
        let hub = Arc::new(BroadcastHub::new());
        let (_viewer, mut rx) = hub.join();
        let relay = relay_for(channels::TF, &hub);
        let tf = |sec: i64| {
            json!({"transforms": [{
                "header": {"stamp": {"sec": sec, "nanosec": 0}, "frame_id": "map"},
                "child_frame_id": "base_link",
                "transform": {"translation": {"x": sec}}
            }]})
        };

        assert_eq!(relay.handle(&tf(5)), 1);
        assert_eq!(relay.handle(&tf(4)), 0);
        let envelope: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(envelope["type"], "robot_tf");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_mission_status_is_suppressed() {
        let hub = Arc::new(BroadcastHub::new());
        let (_viewer, _rx) = hub.join();
        let relay = relay_for(channels::MISSION_STATUS, &hub);
        let status = json!({"mission_id": "m1", "status": "running"});

        assert_eq!(relay.handle(&status), 1);
        assert_eq!(relay.handle(&status), 0);
    }

    #[tokio::test]
    async fn reset_accepts_transforms_from_a_restarted_clock() {
        let hub = Arc::new(BroadcastHub::new());
        let (_viewer, _rx) = hub.join();
        let relay = relay_for(channels::TF, &hub);
        let tf = |sec: i64| {
            json!({"transforms": [{
                "header": {"stamp": {"sec": sec, "nanosec": 0}, "frame_id": "map"},
                "child_frame_id": "base_link",
                "transform": {"translation": {"x": sec}}
            }]})
        };

        assert_eq!(relay.handle(&tf(1000)), 1);
        assert_eq!(relay.handle(&tf(5)), 0);
        relay.reset();
        assert_eq!(relay.handle(&tf(5)), 1);
    }

    #[tokio::test]
    async fn retained_relays_catch_up_late_viewers() {
        let hub = Arc::new(BroadcastHub::new());
        relay_for(channels::BRAKE_STATUS, &hub).handle(&json!({"data": true}));
        relay_for(channels::SCAN, &hub).handle(&json!({"ranges": [1.0]}));

        let (viewer, mut rx) = hub.join();
        assert_eq!(hub.replay_last_known(&viewer), 1);
        let envelope: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(envelope["type"], "brake_update");
    }

    #[tokio::test]
    async fn relays_subscribe_on_every_connect() {
        let mut server = FakeRosbridge::start().await;
        let transport = Arc::new(
            TransportConnection::new(server.url()).with_retry_interval(Duration::from_millis(30)),
        );
        let registry = ChannelSubscriptionRegistry::attach(Arc::clone(&transport));
        let hub = Arc::new(BroadcastHub::new());
        let ids = install_relays(&transport, &registry, &hub);
        assert_eq!(ids.len(), RELAYS.len());

        transport.connect();
        wait_until(|| registry.channels().len() == RELAYS.len()).await;

        let scan = loop {
            let frame = server.next_op("subscribe").await;
            if frame["topic"] == channels::SCAN {
                break frame;
            }
        };
        assert_eq!(scan["throttle_rate"], 100);

        server.drop_client();
        wait_until(|| server.connections() == 2).await;
        wait_until(|| registry.channels().len() == RELAYS.len()).await;

        let (_viewer, mut rx) = hub.join();
        server.publish(channels::ODOM, json!({"pose": {"x": 1}}));
        let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let envelope: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope["type"], "odom_update");
    }

    #[tokio::test]
    async fn transforms_flow_again_after_reconnect_with_earlier_stamps() {
        let mut server = FakeRosbridge::start().await;
        let transport = Arc::new(
            TransportConnection::new(server.url()).with_retry_interval(Duration::from_millis(30)),
        );
        let registry = ChannelSubscriptionRegistry::attach(Arc::clone(&transport));
        let hub = Arc::new(BroadcastHub::new());
        install_relays(&transport, &registry, &hub);
        let tf = |sec: i64, x: f64| {
            json!({"transforms": [{
                "header": {"stamp": {"sec": sec, "nanosec": 0}, "frame_id": "map"},
                "child_frame_id": "base_link",
                "transform": {"translation": {"x": x}}
            }]})
        };
        transport.connect();
        while server.next_op("subscribe").await["topic"] != channels::TF {}

        let (_viewer, mut rx) = hub.join();
        server.publish(channels::TF, tf(1000, 1.0));
        let first = next_of_kind(&mut rx, "robot_tf").await;
        assert_eq!(first["data"]["transforms"][0]["transform"]["translation"]["x"], 1.0);

        server.drop_client();
        wait_until(|| server.connections() == 2).await;
        while server.next_op("subscribe").await["topic"] != channels::TF {}

        server.publish(channels::TF, tf(5, 2.0));
        let after = next_of_kind(&mut rx, "robot_tf").await;
        assert_eq!(after["data"]["transforms"][0]["transform"]["translation"]["x"], 2.0);
    }
}
