//! `rosdeck-dialog` – human-in-the-loop questions from the robot.
//!
//! - [`decode`] – normalizes heterogeneous question payloads.
//! - [`templates`] – field-descriptor template per type tag.
//! - [`correlator`] – pending question store and answer relay.
//! - [`relay`] – subscribes the dialog topics on every connect.

pub mod correlator;
pub mod decode;
pub mod relay;
pub mod templates;

pub use correlator::{DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL, DialogCorrelator, LocalQuestion};
pub use decode::{DecodedQuestion, RawQuestionEvent, decode_question};
pub use relay::install_dialog_relay;
