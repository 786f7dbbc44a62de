use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{Severity, Stage};

/// Immutable input of a run, as submitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunInput {
    pub target_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Source code snippet supplied with the challenge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Flag format hint such as `CTF{*}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl RunInput {
    pub fn new(target_url: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            ..Default::default()
        }
    }

    /// Display name: the title if one was given, otherwise the target URL.
    pub fn display_name(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&self.target_url)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormDescriptor {
    /// Absolute action URL
    pub action: String,
    /// Upper-cased HTTP method
    pub method: String,
    pub fields: Vec<FormField>,
    /// Page the form was found on
    pub page_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub stage: Stage,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vulnerability {
    #[serde(rename = "type")]
    pub vuln_type: String,
    pub description: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuzzTaskStatus {
    Pending,
    Attempted,
}

/// A queued exploitation attempt. Tasks are never removed from the queue;
/// their status only moves from `pending` to `attempted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzTask {
    pub target: String,
    pub payload_class: String,
    /// Vulnerability type this task exercises, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vulnerability: Option<String>,
    pub status: FuzzTaskStatus,
}

impl FuzzTask {
    pub fn pending(target: impl Into<String>, payload_class: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            payload_class: payload_class.into(),
            vulnerability: None,
            status: FuzzTaskStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    pub value: String,
    pub stage: Stage,
    pub found_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub stage: Stage,
    pub message: String,
}
