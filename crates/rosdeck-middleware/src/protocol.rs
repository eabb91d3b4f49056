//! rosbridge v2 JSON frames.
//!
//! The robot's pub/sub broker is a `rosbridge_server`; every interaction is a
//! JSON object tagged by `op`. Only the operations the bridge needs are
//! modelled here. Inbound frames with an unknown `op` decode to
//! [`InboundFrame::Other`] instead of failing.

use rosdeck_types::DeckError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A frame sent from the bridge to the broker.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OutboundFrame<'a> {
    Subscribe {
        id: &'a str,
        topic: &'a str,
        #[serde(rename = "type")]
        message_type: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        throttle_rate: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        queue_length: Option<u32>,
    },
    Unsubscribe {
        id: &'a str,
        topic: &'a str,
    },
    Advertise {
        topic: &'a str,
        #[serde(rename = "type")]
        message_type: &'a str,
    },
    Publish {
        topic: &'a str,
        msg: &'a Value,
    },
    CallService {
        id: &'a str,
        service: &'a str,
        args: &'a Value,
    },
}

impl OutboundFrame<'_> {
    pub fn encode(&self) -> Result<String, DeckError> {
        serde_json::to_string(self).map_err(|e| DeckError::Serialization(e.to_string()))
    }
}

/// A frame received from the broker.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InboundFrame {
    Publish {
        topic: String,
        #[serde(default)]
        msg: Value,
    },
    ServiceResponse {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        service: String,
        #[serde(default)]
        values: Value,
        #[serde(default = "default_result")]
        result: bool,
    },
    Status {
        #[serde(default)]
        level: String,
        #[serde(default)]
        msg: String,
    },
    #[serde(other)]
    Other,
}

fn default_result() -> bool {
    true
}

impl InboundFrame {
    pub fn decode(text: &str) -> Result<Self, DeckError> {
        serde_json::from_str(text).map_err(|e| DeckError::MalformedPayload(e.to_string()))
    }
}
