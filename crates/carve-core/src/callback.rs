use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::TaskError;
use crate::task::{Task, TaskStatus};
use crate::traits::Notifier;

/// Body POSTed to a task's `callback_url` once it reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub source_id: String,
    pub schema_id: String,
    pub schema_version: u32,
    pub target_url: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub records_extracted: u64,
    pub records_rejected: u64,
    pub pages_processed: u32,
    pub error_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<TaskError>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Task> for CallbackPayload {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            source_id: task.source_id.clone(),
            schema_id: task.schema_id.clone(),
            schema_version: task.schema_version,
            target_url: task.target_url.clone(),
            attempt: task.attempt,
            max_attempts: task.max_attempts,
            records_extracted: task.records_extracted,
            records_rejected: task.records_rejected,
            pages_processed: task.pages_processed,
            error_count: task.errors.len(),
            last_error: task.errors.last().cloned(),
            completed_at: task.completed_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallbackPolicy {
    pub attempts: u32,
    /// Wait before attempt `n + 1` is `n * backoff`.
    pub backoff: Duration,
}

impl Default for CallbackPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Best-effort delivery of the terminal-state callback.
///
/// Failures are logged and never affect the task. Returns whether the
/// callback was delivered.
pub async fn deliver_callback<N: Notifier>(
    notifier: &N,
    task: &Task,
    policy: &CallbackPolicy,
) -> bool {
    let Some(url) = task.callback_url.as_deref() else {
        return false;
    };
    if !task.status.is_terminal() {
        return false;
    }

    let payload = CallbackPayload::from(task);
    for attempt in 1..=policy.attempts {
        match notifier.notify(url, &payload).await {
            Ok(()) => {
                tracing::debug!(task_id = %task.id, %url, attempt, "Callback delivered");
                return true;
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, %url, attempt, error = %e, "Callback failed");
                if attempt < policy.attempts {
                    tokio::time::sleep(policy.backoff * attempt).await;
                }
            }
        }
    }
    tracing::error!(task_id = %task.id, %url, "Giving up on callback");
    false
}
