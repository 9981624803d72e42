use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Mode, TaskError};
use crate::util::rand_jitter_ms;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 5;
pub const MAX_ATTEMPTS_CAP: u32 = 10;

/// Lifecycle status of a task.
///
/// Ordering follows the lifecycle, so maps keyed by status list in a
/// natural order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Success,
    Partial,
    Failed,
    Dlq,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Pending,
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Success,
        TaskStatus::Partial,
        TaskStatus::Failed,
        TaskStatus::Dlq,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Partial => "partial",
            TaskStatus::Failed => "failed",
            TaskStatus::Dlq => "dlq",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// No worker will pick the task up again without an operator retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success
                | TaskStatus::Partial
                | TaskStatus::Failed
                | TaskStatus::Dlq
                | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.to_lowercase())
            .ok_or_else(|| format!("Unknown task status: {s}"))
    }
}

/// One entry of a task's append-only status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub attempt: u32,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The unit of work: extract one target URL with one schema version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub source_id: String,
    pub schema_id: String,
    pub schema_version: u32,
    pub target_url: String,
    pub mode: Mode,
    pub priority: u8,
    pub status: TaskStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub records_extracted: u64,
    pub records_rejected: u64,
    pub pages_processed: u32,
    pub errors: Vec<TaskError>,
    pub history: Vec<StatusChange>,
    pub cancel_requested: bool,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub callback_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub scheduled_for: DateTime<Utc>,
}

impl Task {
    /// A fresh `pending` task.
    pub fn new(new: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id: new.source_id,
            schema_id: new.schema_id,
            schema_version: new.schema_version,
            target_url: new.target_url,
            mode: new.mode,
            priority: new.priority,
            status: TaskStatus::Pending,
            attempt: 0,
            max_attempts: new.max_attempts,
            records_extracted: 0,
            records_rejected: 0,
            pages_processed: 0,
            errors: Vec::new(),
            history: Vec::new(),
            cancel_requested: false,
            worker_id: None,
            lease_expires_at: None,
            callback_url: new.callback_url,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            scheduled_for: new.scheduled_for.unwrap_or(now),
        }
    }

    /// `Conflict` unless `worker_id` holds the running attempt.
    pub fn ensure_held_by(&self, worker_id: &str) -> Result<(), AppError> {
        if self.status == TaskStatus::Running && self.worker_id.as_deref() == Some(worker_id) {
            Ok(())
        } else {
            Err(AppError::Conflict(format!(
                "task {} is not held by worker {worker_id}",
                self.id
            )))
        }
    }

    /// Wall-clock time of the last finished attempt.
    pub fn duration(&self) -> Option<TimeDelta> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) if end >= start => Some(end - start),
            _ => None,
        }
    }
}

/// A validated task, bound to a concrete schema version and mode.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub source_id: String,
    pub schema_id: String,
    pub schema_version: u32,
    pub target_url: String,
    pub mode: Mode,
    pub priority: u8,
    pub max_attempts: u32,
    pub callback_url: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Request to create a task, as submitted by API callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub source_id: String,
    pub schema_id: String,
    /// Pin a version; the latest version is used when absent.
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub target_url: String,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl CreateTaskRequest {
    pub fn new(
        source_id: impl Into<String>,
        schema_id: impl Into<String>,
        target_url: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            schema_id: schema_id.into(),
            schema_version: None,
            target_url: target_url.into(),
            mode: default_mode(),
            priority: default_priority(),
            max_attempts: default_max_attempts(),
            callback_url: None,
            scheduled_for: None,
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = Some(version);
        self
    }

    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    /// Checks that do not need the schema.
    pub fn validate(&self) -> Result<(), AppError> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(AppError::ValidationError(format!(
                "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}"
            )));
        }
        if !(1..=MAX_ATTEMPTS_CAP).contains(&self.max_attempts) {
            return Err(AppError::ValidationError(format!(
                "max_attempts must be between 1 and {MAX_ATTEMPTS_CAP}"
            )));
        }
        validate_http_url("target_url", &self.target_url)?;
        if let Some(callback) = &self.callback_url {
            validate_http_url("callback_url", callback)?;
        }
        Ok(())
    }
}

fn validate_http_url(label: &str, raw: &str) -> Result<(), AppError> {
    let url = url::Url::parse(raw)
        .map_err(|e| AppError::ValidationError(format!("{label} is not a valid URL: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(AppError::ValidationError(format!(
            "{label} must use http or https, got '{scheme}'"
        ))),
    }
}

fn default_mode() -> Mode {
    Mode::Http
}

fn default_priority() -> u8 {
    3
}

fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub source_id: Option<String>,
    pub schema_id: Option<String>,
    pub mode: Option<Mode>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            status: None,
            source_id: None,
            schema_id: None,
            mode: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl TaskFilter {
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| s == task.status)
            && self.mode.is_none_or(|m| m == task.mode)
            && self
                .source_id
                .as_deref()
                .is_none_or(|s| s == task.source_id)
            && self
                .schema_id
                .as_deref()
                .is_none_or(|s| s == task.schema_id)
    }
}

/// One page of a task listing, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: u64,
}

/// Automatic retry schedule.
///
/// Delay doubles per attempt from `base_delay`, capped at `max_delay`,
/// plus up to 20% random jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: TimeDelta,
    pub max_delay: TimeDelta,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: TimeDelta::seconds(5),
            max_delay: TimeDelta::minutes(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No delay at all; used by tests and one-shot runs.
    pub fn immediate() -> Self {
        Self {
            base_delay: TimeDelta::zero(),
            max_delay: TimeDelta::zero(),
            jitter: false,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> TimeDelta {
        let exponent = attempt.saturating_sub(1).min(20);
        let base_ms = self.base_delay.num_milliseconds().max(0);
        let max_ms = self.max_delay.num_milliseconds().max(0);
        let delay_ms = base_ms.saturating_mul(1_i64 << exponent).min(max_ms);
        let jitter_ms = if self.jitter {
            rand_jitter_ms((delay_ms / 5) as u64) as i64
        } else {
            0
        };
        TimeDelta::milliseconds(delay_ms + jitter_ms)
    }
}

/// How an attempt ended, as seen by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Outcome {
    Success,
    Partial,
    Failed { retryable: bool },
    Cancelled,
}

/// Result of one attempt, handed to the queue when the worker finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub outcome: Outcome,
    /// Records newly stored by this attempt.
    pub records_saved: u64,
    pub records_rejected: u64,
    pub pages: u32,
    pub errors: Vec<TaskError>,
}

impl AttemptReport {
    pub fn failed(error: TaskError, retryable: bool) -> Self {
        Self {
            outcome: Outcome::Failed { retryable },
            records_saved: 0,
            records_rejected: 0,
            pages: 0,
            errors: vec![error],
        }
    }
}
