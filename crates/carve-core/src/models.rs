use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Page acquisition strategy for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Http,
    Browser,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::Http, Mode::Browser];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Http => "http",
            Mode::Browser => "browser",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Mode::Http),
            "browser" => Ok(Mode::Browser),
            _ => Err(format!("Unknown mode: {s}")),
        }
    }
}

/// Classification of an entry in a task's error trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NavigationFailed,
    FetchFailed,
    RenderTimeout,
    Timeout,
    SelectorNoMatch,
    TransformationFailed,
    PaginationFailed,
    SchemaInvalid,
    LeaseExpired,
    Internal,
    MaxAttemptsExceeded,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NavigationFailed => "navigation_failed",
            ErrorKind::FetchFailed => "fetch_failed",
            ErrorKind::RenderTimeout => "render_timeout",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SelectorNoMatch => "selector_no_match",
            ErrorKind::TransformationFailed => "transformation_failed",
            ErrorKind::PaginationFailed => "pagination_failed",
            ErrorKind::SchemaInvalid => "schema_invalid",
            ErrorKind::LeaseExpired => "lease_expired",
            ErrorKind::Internal => "internal",
            ErrorKind::MaxAttemptsExceeded => "max_attempts_exceeded",
        }
    }

    /// Field-level kinds degrade a record, never the whole attempt.
    pub fn is_field_level(&self) -> bool {
        matches!(
            self,
            ErrorKind::SelectorNoMatch | ErrorKind::TransformationFailed
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry of a task's append-only error trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    pub occurred_at: DateTime<Utc>,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            attempt,
            field: None,
            page: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }
}

/// A record ready to be stored, keyed by its fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub record_hash: String,
    pub page: u32,
    pub data: serde_json::Value,
}

/// A stored record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub task_id: Uuid,
    pub record_hash: String,
    pub page: u32,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stable fingerprint of an extracted record.
///
/// With `keys`, only those fields participate; otherwise the whole record.
pub fn record_fingerprint(record: &serde_json::Value, keys: &[String]) -> String {
    if keys.is_empty() {
        return compute_hash(&record.to_string());
    }
    let picked: Vec<serde_json::Value> = keys
        .iter()
        .map(|k| record.get(k).cloned().unwrap_or(serde_json::Value::Null))
        .collect();
    compute_hash(&serde_json::Value::Array(picked).to_string())
}
