//! Shared vocabulary for the rosdeck bridge.
//!
//! Every other crate in the workspace speaks in these types: the error
//! taxonomy, the transport's connection state, the envelope pushed to
//! dashboard viewers, the robot command service contract and the dialog
//! data model.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod dialog;

pub use dialog::{
    DialogQuestion, DialogStatus, FieldDescriptor, FieldOption, FieldType, LookupSource,
    PendingDialogRequest,
};

/// Channel and service names on the robot's pub/sub transport.
pub mod channels {
    /// Service used for every discrete robot command.
    pub const ROBOT_COMMAND_SERVICE: &str = "/robot/command";

    pub const MAP: &str = "/map";
    pub const TF: &str = "/tf";
    pub const SCAN: &str = "/scan";
    pub const ODOM: &str = "/odom";
    pub const BRAKE_STATUS: &str = "/brake_status";
    pub const ROBOT_STATUS: &str = "/robot/status";
    pub const MAP_CHANGE: &str = "/robot/map/change";
    pub const MISSION_ADDED: &str = "/robot/mission/added";
    pub const MISSION_STATUS: &str = "/robot/mission/status";

    /// Inbound questions raised by the robot for an operator.
    pub const DIALOG_REQUEST: &str = "/robot/dialog/variable/request";
    /// Inbound withdrawal of a question the robot no longer needs answered.
    pub const DIALOG_CANCEL: &str = "/robot/dialog/variable/cancel";
    /// Outbound answers, correlated by request id.
    pub const DIALOG_RESPONSE: &str = "/robot/dialog/variable/response";
}

/// Envelope `type` values understood by the dashboard.
pub mod kinds {
    pub const MAP_UPDATE: &str = "map_update";
    pub const ROBOT_TF: &str = "robot_tf";
    pub const SCAN_UPDATE: &str = "scan_update";
    pub const ODOM_UPDATE: &str = "odom_update";
    pub const BRAKE_UPDATE: &str = "brake_update";
    pub const ROBOT_STATUS: &str = "robotStatus";
    pub const DIALOG_UPDATE: &str = "dialogUpdate";
    pub const MAP_CHANGE: &str = "map_change";
    pub const MISSION_QUEUE_ADDED: &str = "mission_queue_added";
    pub const MISSION_QUEUE_STATUS: &str = "mission_queue_status";
}

/// Lifecycle of the single transport connection.
///
/// Transitions happen only in response to transport events (open, close,
/// failed attempt), never from feature code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Uniform shape pushed to every dashboard viewer: `{"type": .., "data": ..}`.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEnvelope<'a, T: Serialize + ?Sized> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub data: &'a T,
}

impl<'a, T: Serialize + ?Sized> OutboundEnvelope<'a, T> {
    pub fn new(kind: &'a str, data: &'a T) -> Self {
        Self { kind, data }
    }

    /// Serialize the envelope to the JSON text sent over viewer sockets.
    pub fn to_json(&self) -> Result<String, DeckError> {
        serde_json::to_string(self).map_err(|e| DeckError::Serialization(e.to_string()))
    }
}

/// Request body of the `/robot/command` service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotCommandRequest {
    pub cmd: i32,
    #[serde(default)]
    pub msg: String,
}

/// Reply of the `/robot/command` service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotCommandReply {
    pub result: bool,
    #[serde(default)]
    pub msg: String,
}

/// Error taxonomy shared by the transport, the invoker and the dialog
/// correlator.
#[derive(Error, Debug)]
pub enum DeckError {
    /// No live transport connection at call time. Never queued.
    #[error("transport unavailable: no active connection to the robot")]
    TransportUnavailable,

    /// The peer rejected a service call.
    #[error("remote fault: {0}")]
    RemoteFault(String),

    /// A caller-imposed deadline expired.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// An operation referenced an unknown id.
    #[error("not found: {0}")]
    NotFound(String),

    /// A payload did not match any decode strategy.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("channel error: {0}")]
    Channel(String),
}
