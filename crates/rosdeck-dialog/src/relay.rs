//! Wiring between the robot's dialog topics and the correlator.

use std::sync::Arc;

use rosdeck_middleware::{
    ChannelSubscriptionRegistry, MessageHandler, Observer, ObserverId, TransportConnection,
};
use rosdeck_types::{DeckError, channels};
use serde_json::Value;
use tracing::{debug, warn};

use crate::correlator::DialogCorrelator;
use crate::decode::{RawQuestionEvent, correlation_id};

/// Message type of the question and cancel topics.
pub const DIALOG_MESSAGE_TYPE: &str = "std_msgs/msg/String";

/// Message type advertised for replies.
pub const DIALOG_RESPONSE_TYPE: &str = "std_msgs/msg/String";

/// Feed one message from the question topic into the correlator.
pub fn on_question(correlator: &DialogCorrelator, msg: &Value) {
    correlator.receive_question(RawQuestionEvent::from_value(msg));
}

/// Handle one message from the cancel topic.
pub fn on_cancel(correlator: &DialogCorrelator, msg: &Value) {
    match correlation_id(msg) {
        Some(id) => {
            if !correlator.withdraw(&id) {
                debug!(id, "cancel for unknown dialog question");
            }
        }
        None => warn!("dialog cancel without correlation id ignored"),
    }
}

/// Subscribe the question and cancel topics and advertise the response topic
/// on every (re)connect.
pub fn install_dialog_relay(
    transport: &TransportConnection,
    registry: &Arc<ChannelSubscriptionRegistry>,
    correlator: &Arc<DialogCorrelator>,
) -> ObserverId {
    let weak_registry = Arc::downgrade(registry);
    let correlator = Arc::clone(correlator);
    let observer: Arc<Observer> = Arc::new(move |transport: &TransportConnection| {
        let Some(registry) = weak_registry.upgrade() else {
            return Ok(());
        };
        subscribe(transport, &registry, &correlator)
    });

    if transport.is_connected()
        && let Err(e) = observer(transport)
    {
        warn!(error = %e, "initial dialog relay setup failed");
    }
    transport.on_connect(observer)
}

fn subscribe(
    transport: &TransportConnection,
    registry: &ChannelSubscriptionRegistry,
    correlator: &Arc<DialogCorrelator>,
) -> Result<(), DeckError> {
    transport.advertise(channels::DIALOG_RESPONSE, DIALOG_RESPONSE_TYPE)?;

    let questions: Arc<MessageHandler> = {
        let correlator = Arc::clone(correlator);
        Arc::new(move |msg: &Value| on_question(&correlator, msg))
    };
    registry.ensure_subscribed(channels::DIALOG_REQUEST, DIALOG_MESSAGE_TYPE, questions)?;

    let cancels: Arc<MessageHandler> = {
        let correlator = Arc::clone(correlator);
        Arc::new(move |msg: &Value| on_cancel(&correlator, msg))
    };
    registry.ensure_subscribed(channels::DIALOG_CANCEL, DIALOG_MESSAGE_TYPE, cancels)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rosdeck_middleware::BroadcastHub;
    use rosdeck_middleware::testing::{FakeRosbridge, wait_until};
    use serde_json::json;

    fn offline_correlator() -> DialogCorrelator {
        let transport: Arc<TransportConnection> = Arc::new(TransportConnection::new("ws://127.0.0.1:1"));
        DialogCorrelator::new(transport, Arc::new(BroadcastHub::new()))
    }

    #[test]
    fn question_messages_reach_the_correlator() {
        let correlator = offline_correlator();
        on_question(
            &correlator,
            &json!({"id": "q1", "message": r#"{"type":"yes_no","message":"Proceed?"}"#}),
        );
        assert_eq!(correlator.pending_count(), 1);
        assert_eq!(correlator.get("q1").unwrap().question().descriptor.label, "Proceed?");
    }

    #[test]
    fn question_without_id_is_dropped() {
        let correlator = offline_correlator();
        on_question(&correlator, &json!({"message": "INT:n"}));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn robot_cancel_withdraws_question() {
        let correlator = offline_correlator();
        on_question(&correlator, &json!({"id": "q1", "message": "INT:n"}));
        on_cancel(&correlator, &json!({"data": "q1"}));
        assert!(correlator.get("q1").is_none());
    }

    #[test]
    fn cancel_for_unknown_id_is_harmless() {
        let correlator = offline_correlator();
        on_question(&correlator, &json!({"id": "q1", "message": "INT:n"}));
        on_cancel(&correlator, &json!({"id": "other"}));
        on_cancel(&correlator, &json!({}));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn install_without_connection_only_registers_observer() {
        let transport = Arc::new(TransportConnection::new("ws://127.0.0.1:1"));
        let registry = ChannelSubscriptionRegistry::attach(Arc::clone(&transport));
        let correlator = Arc::new(offline_correlator());

        install_dialog_relay(&transport, &registry, &correlator);
        assert!(registry.channels().is_empty());
    }

    #[tokio::test]
    async fn answers_match_the_advertised_response_type() {
        let mut server = FakeRosbridge::start().await;
        let transport = Arc::new(TransportConnection::new(server.url()));
        let registry = ChannelSubscriptionRegistry::attach(Arc::clone(&transport));
        let correlator = Arc::new(DialogCorrelator::new(transport.clone(), Arc::new(BroadcastHub::new())));
        install_dialog_relay(&transport, &registry, &correlator);

        transport.connect();
        wait_until(|| registry.is_subscribed(channels::DIALOG_CANCEL)).await;

        let advertise = server.next_op("advertise").await;
        assert_eq!(advertise["topic"], channels::DIALOG_RESPONSE);
        assert_eq!(advertise["type"], "std_msgs/msg/String");

        let question = json!({"id": "q1", "message": "INT: How many pallets?"}).to_string();
        server.publish(channels::DIALOG_REQUEST, json!({"data": question}));
        wait_until(|| correlator.pending_count() == 1).await;

        correlator.answer("q1", json!(3)).unwrap();
        let publish = loop {
            let frame = server.next_op("publish").await;
            if frame["topic"] == channels::DIALOG_RESPONSE {
                break frame;
            }
        };
        let msg = publish["msg"].as_object().unwrap();
        assert_eq!(msg.len(), 1, "std_msgs/String has a single `data` field");
        let reply: Value = serde_json::from_str(msg["data"].as_str().unwrap()).unwrap();
        assert_eq!(reply, json!({"id": "q1", "accepted": true, "value": 3}));
    }
}
