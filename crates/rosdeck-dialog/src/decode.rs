//! Normalization of dialog question payloads into a [`FieldDescriptor`].
//!
//! The robot encodes questions in several ways. Strategies are tried in a
//! fixed order and the first that applies wins:
//!
//! 1. A JSON object with a `type` tag selects a template from
//!    [`crate::templates`]; its `message` becomes the label.
//! 2. If that `message` is itself a serialized array of
//!    `{text, value, is_current}` records, the current record supplies the
//!    label and the pre-filled default, and every record becomes an option.
//! 3. Text that is not JSON is tried as `TYPE:freeform text`.
//! 4. Anything else is kept as a plain text question and flagged malformed.
//!
//! No input is rejected: the last strategy always applies.

use rosdeck_types::{FieldDescriptor, FieldOption};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::templates::{is_known_tag, template_for};

/// Result of running the decode pipeline over one question.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedQuestion {
    pub descriptor: FieldDescriptor,
    /// Why no strategy fully matched, when the question fell back to text.
    pub malformed: Option<String>,
}

impl DecodedQuestion {
    fn matched(descriptor: FieldDescriptor) -> Self {
        Self {
            descriptor,
            malformed: None,
        }
    }

    fn fallback(label: &str, reason: impl Into<String>) -> Self {
        Self {
            descriptor: FieldDescriptor::text(label),
            malformed: Some(reason.into()),
        }
    }
}

/// A question event as received from the robot, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawQuestionEvent {
    /// Correlation id. Events without one are never stored.
    pub id: Option<String>,
    pub message: String,
}

impl RawQuestionEvent {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            message: message.into(),
        }
    }

    /// Read an event from a topic message.
    ///
    /// Accepts `{"id", "message"}` directly, or the same object serialized
    /// inside a `std_msgs/String` `data` field. Numeric ids are stringified;
    /// a non-string `message` is kept as its JSON text.
    pub fn from_value(msg: &Value) -> Self {
        if msg.get("id").is_none()
            && let Some(data) = msg.get("data").and_then(Value::as_str)
            && let Ok(inner @ Value::Object(_)) = serde_json::from_str::<Value>(data)
        {
            return Self::from_value(&inner);
        }

        let message = match msg.get("message") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        Self {
            id: id_field(msg),
            message,
        }
    }
}

/// The correlation id named by a cancel message: an `id` field (possibly
/// serialized inside `data`), or the bare id as a `std_msgs/String` payload.
/// Empty strings count as missing.
pub fn correlation_id(msg: &Value) -> Option<String> {
    if msg.get("id").is_some() || msg.get("request_id").is_some() {
        return id_field(msg);
    }
    if let Some(data) = msg.get("data").and_then(Value::as_str)
        && let Ok(inner @ Value::Object(_)) = serde_json::from_str::<Value>(data)
    {
        return id_field(&inner);
    }
    msg.as_str()
        .or_else(|| msg.get("data").and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn id_field(msg: &Value) -> Option<String> {
    match msg.get("id").or_else(|| msg.get("request_id"))? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct ChoiceRecord {
    text: String,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    is_current: bool,
}

/// Run the decode pipeline over a raw question message.
pub fn decode_question(message: &str) -> DecodedQuestion {
    match serde_json::from_str::<Value>(message) {
        Ok(Value::Object(fields)) => decode_tagged(message, &fields),
        Ok(_) => DecodedQuestion::fallback(message, "JSON payload is not an object"),
        Err(_) => decode_prefixed(message)
            .unwrap_or_else(|| DecodedQuestion::fallback(message.trim(), "no type tag")),
    }
}

fn decode_tagged(raw: &str, fields: &Map<String, Value>) -> DecodedQuestion {
    let text = match fields.get("message") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };

    let Some(tag) = fields.get("type").and_then(Value::as_str) else {
        let label = if text.is_empty() { raw } else { text.as_str() };
        return DecodedQuestion::fallback(label, "missing type tag");
    };

    let records = choice_records(&text);
    let current = records
        .iter()
        .find(|r| r.is_current)
        .or_else(|| records.first());
    let label = current.map_or(text.as_str(), |r| r.text.as_str());

    let mut decoded = match template_for(tag, label) {
        Some(descriptor) => DecodedQuestion::matched(descriptor),
        None => DecodedQuestion::fallback(label, format!("unknown field type '{tag}'")),
    };
    let descriptor = &mut decoded.descriptor;

    if !records.is_empty() {
        descriptor.options = records
            .iter()
            .map(|r| FieldOption::new(r.text.clone(), value_text(&r.value)))
            .collect();
        descriptor.default = records
            .iter()
            .find(|r| r.is_current)
            .map(|r| value_text(&r.value));
    }
    apply_overrides(descriptor, fields);
    decoded
}

fn decode_prefixed(message: &str) -> Option<DecodedQuestion> {
    let (tag, text) = message.split_once(':')?;
    let tag = tag.trim();
    if tag.is_empty() || tag.contains(char::is_whitespace) || !is_known_tag(tag) {
        return None;
    }
    template_for(tag, text.trim()).map(DecodedQuestion::matched)
}

fn choice_records(text: &str) -> Vec<ChoiceRecord> {
    if !text.trim_start().starts_with('[') {
        return Vec::new();
    }
    serde_json::from_str(text).unwrap_or_default()
}

/// Explicit `default`, `min`, `max` and `step` fields on the payload win
/// over the template.
pub(crate) fn apply_overrides(descriptor: &mut FieldDescriptor, fields: &Map<String, Value>) {
    if let Some(default) = fields.get("default").filter(|v| !v.is_null()) {
        descriptor.default = Some(value_text(default));
    }
    if let Some(min) = fields.get("min").and_then(Value::as_f64) {
        descriptor.min = Some(min);
    }
    if let Some(max) = fields.get("max").and_then(Value::as_f64) {
        descriptor.max = Some(max);
    }
    if let Some(step) = fields.get("step").and_then(Value::as_f64) {
        descriptor.step = Some(step);
    }
}

pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
