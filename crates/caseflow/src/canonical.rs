//! Canonical artifact model.
//!
//! The provider-neutral intermediate every migration passes through: source
//! adapters map into it, target adapters map out of it. Serialization is
//! stable and self-describing; fields this version does not know are captured
//! in `extra` so a round trip through the canonical form is lossless.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Custom-attribute key preserving a non-canonical source status.
pub const ORIGINAL_STATUS_KEY: &str = "originalStatus";

/// Custom-attribute key preserving a non-canonical source priority.
pub const ORIGINAL_PRIORITY_KEY: &str = "originalPriority";

/// Canonical priority values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Parse a canonical priority name (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "CRITICAL" => Some(Priority::Critical),
            "HIGH" => Some(Priority::High),
            "MEDIUM" => Some(Priority::Medium),
            "LOW" => Some(Priority::Low),
            _ => None,
        }
    }

    /// Canonical wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
        }
    }
}

/// Canonical status values. Non-canonical provider statuses map to `Other`
/// with the original preserved under [`ORIGINAL_STATUS_KEY`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Draft,
    Ready,
    Approved,
    Deprecated,
    Passed,
    Failed,
    NotRun,
    Blocked,
    Other,
}

impl Status {
    /// Parse a canonical status name (case-insensitive, `NOT_RUN` style).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "DRAFT" => Some(Status::Draft),
            "READY" => Some(Status::Ready),
            "APPROVED" => Some(Status::Approved),
            "DEPRECATED" => Some(Status::Deprecated),
            "PASSED" => Some(Status::Passed),
            "FAILED" => Some(Status::Failed),
            "NOT_RUN" => Some(Status::NotRun),
            "BLOCKED" => Some(Status::Blocked),
            "OTHER" => Some(Status::Other),
            _ => None,
        }
    }

    /// Canonical wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Draft => "DRAFT",
            Status::Ready => "READY",
            Status::Approved => "APPROVED",
            Status::Deprecated => "DEPRECATED",
            Status::Passed => "PASSED",
            Status::Failed => "FAILED",
            Status::NotRun => "NOT_RUN",
            Status::Blocked => "BLOCKED",
            Status::Other => "OTHER",
        }
    }
}

/// One ordered test step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestStep {
    /// What the tester does.
    #[serde(default)]
    pub action: String,
    /// What the tester should observe.
    #[serde(default)]
    pub expected: String,
}

/// A reference to an attachment by logical identifier; content is fetched
/// separately through `get_attachment_content`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Logical identifier within the source provider.
    pub id: String,
    /// File name.
    #[serde(default)]
    pub file_name: String,
    /// MIME type, when known.
    #[serde(default)]
    pub content_type: String,
    /// Size in bytes, when known.
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

/// The canonical, provider-neutral test-case representation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalArtifact {
    /// Stable identifier within the source provider.
    pub source_id: String,

    /// Title.
    #[serde(default)]
    pub title: String,

    /// Description (markdown or plain text, provider-dependent).
    #[serde(default)]
    pub description: String,

    /// Ordered test steps.
    #[serde(default)]
    pub steps: Vec<TestStep>,

    /// Canonical priority.
    #[serde(default)]
    pub priority: Priority,

    /// Canonical status.
    #[serde(default)]
    pub status: Status,

    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Containing folder/module in the source hierarchy.
    #[serde(default)]
    pub parent_folder: Option<String>,

    /// Provider custom attributes, including preserved originals.
    #[serde(default)]
    pub custom_attributes: BTreeMap<String, serde_json::Value>,

    /// Attachments by logical identifier.
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,

    /// Fields this version does not model, preserved for lossless round trips.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl CanonicalArtifact {
    /// A minimal artifact.
    pub fn new(source_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    /// Set the status from a provider value, preserving non-canonical values
    /// under [`ORIGINAL_STATUS_KEY`].
    pub fn set_status_from(&mut self, value: &str) {
        match Status::parse(value) {
            Some(status) => self.status = status,
            None => {
                self.status = Status::Other;
                self.custom_attributes.insert(
                    ORIGINAL_STATUS_KEY.to_string(),
                    serde_json::Value::String(value.to_string()),
                );
            }
        }
    }

    /// Set the priority from a provider value, preserving non-canonical
    /// values under [`ORIGINAL_PRIORITY_KEY`]; the canonical value falls back
    /// to `MEDIUM`.
    pub fn set_priority_from(&mut self, value: &str) {
        match Priority::parse(value) {
            Some(priority) => self.priority = priority,
            None => {
                self.priority = Priority::Medium;
                self.custom_attributes.insert(
                    ORIGINAL_PRIORITY_KEY.to_string(),
                    serde_json::Value::String(value.to_string()),
                );
            }
        }
    }
}
