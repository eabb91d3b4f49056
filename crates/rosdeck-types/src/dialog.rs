//! Dialog data model: questions the robot (or a local caller) asks a human
//! operator, and the field descriptor a dashboard renders for each.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Input widget a dialog question resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Int,
    Float,
    Combobox,
    Bool,
    /// Read-only notice; the operator can only acknowledge it.
    Message,
}

/// Live data source a combobox must be populated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupSource {
    Position,
    Marker,
}

/// One selectable choice of a combobox or yes/no field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldOption {
    pub label: String,
    pub value: String,
}

impl FieldOption {
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }
}

/// Resolved description of a single dialog question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<FieldOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    #[serde(default)]
    pub needs_lookup: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup: Option<LookupSource>,
    #[serde(default)]
    pub read_only: bool,
}

impl FieldDescriptor {
    /// A plain free-text field labelled `label`.
    pub fn text(label: impl Into<String>) -> Self {
        Self {
            field_type: FieldType::Text,
            label: label.into(),
            default: None,
            options: Vec::new(),
            min: None,
            max: None,
            step: None,
            needs_lookup: false,
            lookup: None,
            read_only: false,
        }
    }
}

/// Whether a question is still waiting for the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogStatus {
    Pending,
    Answered,
}

/// Fields shared by both origins of a dialog request.
#[derive(Debug, Clone, Serialize)]
pub struct DialogQuestion {
    /// Correlation id linking the question to its answer.
    pub id: String,
    /// The undecoded message exactly as it arrived.
    pub raw_question: String,
    pub descriptor: FieldDescriptor,
    pub created_at: DateTime<Utc>,
    /// Set when no decode strategy fully matched and the question was
    /// stored as free text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub malformed: Option<String>,
}

/// A question waiting for (or, for local callers, holding) an answer.
///
/// `Upstream` questions were pushed by the robot over the transport and are
/// removed as soon as they are answered or cancelled. `Local` questions were
/// created through the REST surface and keep their answer in place until the
/// original caller fetches it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum PendingDialogRequest {
    Upstream {
        #[serde(flatten)]
        question: DialogQuestion,
    },
    Local {
        #[serde(flatten)]
        question: DialogQuestion,
        status: DialogStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        answer: Option<Value>,
    },
}

impl PendingDialogRequest {
    pub fn upstream(question: DialogQuestion) -> Self {
        Self::Upstream { question }
    }

    pub fn local(question: DialogQuestion) -> Self {
        Self::Local {
            question,
            status: DialogStatus::Pending,
            answer: None,
        }
    }

    pub fn question(&self) -> &DialogQuestion {
        match self {
            Self::Upstream { question } | Self::Local { question, .. } => question,
        }
    }

    pub fn id(&self) -> &str {
        &self.question().id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.question().created_at
    }

    /// Upstream requests are deleted on their terminal transition, so a
    /// tracked upstream request is always pending.
    pub fn status(&self) -> DialogStatus {
        match self {
            Self::Upstream { .. } => DialogStatus::Pending,
            Self::Local { status, .. } => *status,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status() == DialogStatus::Pending
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream { .. })
    }
}
