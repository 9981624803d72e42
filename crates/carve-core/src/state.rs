//! Task lifecycle transitions.
//!
//! Every status change goes through [`apply`], which checks the edge,
//! appends to the task's history and updates bookkeeping. Queue
//! implementations call it inside whatever atomic section they have
//! (a mutex, a row lock) and persist the result.

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::models::{ErrorKind, TaskError};
use crate::task::{AttemptReport, Outcome, RetryPolicy, Task, TaskStatus};

#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// Admit a pending task to its mode's queue.
    Admit,
    /// A worker took the task; starts a new attempt.
    Claim {
        worker_id: String,
        lease_until: DateTime<Utc>,
    },
    /// The worker finished the attempt.
    Finish(AttemptReport),
    /// The worker stopped renewing its lease.
    LeaseExpired,
    /// Operator retry from `failed` or `dlq`.
    Retry,
    /// Operator cancel.
    Cancel,
}

impl TaskEvent {
    fn action(&self) -> &'static str {
        match self {
            TaskEvent::Admit => "admit",
            TaskEvent::Claim { .. } => "claim",
            TaskEvent::Finish(_) => "finish",
            TaskEvent::LeaseExpired => "expire",
            TaskEvent::Retry => "retry",
            TaskEvent::Cancel => "cancel",
        }
    }
}

pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, Queued)
            | (Pending, Cancelled)
            | (Queued, Running)
            | (Queued, Cancelled)
            | (Running, Success)
            | (Running, Partial)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Failed, Queued)
            | (Failed, Dlq)
            | (Dlq, Queued)
    )
}

/// Apply `event` to `task` at time `now`.
pub fn apply(
    task: &mut Task,
    event: TaskEvent,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let invalid = |task: &Task, event: &TaskEvent| AppError::InvalidTransition {
        from: task.status.to_string(),
        action: event.action().to_string(),
    };

    match event {
        TaskEvent::Admit => {
            if task.status != TaskStatus::Pending {
                return Err(invalid(task, &event));
            }
            transition(task, TaskStatus::Queued, now, None);
        }
        TaskEvent::Claim {
            worker_id,
            lease_until,
        } => {
            if task.status != TaskStatus::Queued {
                return Err(invalid(task, &TaskEvent::Claim { worker_id, lease_until }));
            }
            task.attempt += 1;
            task.worker_id = Some(worker_id.clone());
            task.lease_expires_at = Some(lease_until);
            task.started_at = Some(now);
            task.completed_at = None;
            transition(task, TaskStatus::Running, now, Some(format!("claimed by {worker_id}")));
        }
        TaskEvent::Finish(report) => {
            if task.status != TaskStatus::Running {
                return Err(invalid(task, &TaskEvent::Finish(report)));
            }
            finish(task, report, policy, now);
        }
        TaskEvent::LeaseExpired => {
            if task.status != TaskStatus::Running {
                return Err(invalid(task, &event));
            }
            let holder = task.worker_id.clone().unwrap_or_else(|| "unknown".into());
            task.errors.push(error_at(
                TaskError::new(
                    ErrorKind::LeaseExpired,
                    format!("lease held by {holder} expired"),
                    task.attempt,
                ),
                now,
            ));
            release(task);
            fail(task, true, policy, now);
        }
        TaskEvent::Retry => {
            if !matches!(task.status, TaskStatus::Failed | TaskStatus::Dlq) {
                return Err(invalid(task, &event));
            }
            task.scheduled_for = now;
            task.completed_at = None;
            transition(task, TaskStatus::Queued, now, Some("manual retry".into()));
        }
        TaskEvent::Cancel => match task.status {
            TaskStatus::Pending | TaskStatus::Queued => {
                task.completed_at = Some(now);
                transition(task, TaskStatus::Cancelled, now, Some("cancelled by operator".into()));
            }
            // lands as cancelled at the worker's next checkpoint
            TaskStatus::Running => {
                task.cancel_requested = true;
                task.updated_at = now;
            }
            _ => return Err(invalid(task, &event)),
        },
    }
    Ok(())
}

fn finish(task: &mut Task, report: AttemptReport, policy: &RetryPolicy, now: DateTime<Utc>) {
    let diagnosed = !report.errors.is_empty();
    task.errors.extend(report.errors);
    task.records_extracted += report.records_saved;
    task.records_rejected += report.records_rejected;
    task.pages_processed += report.pages;
    release(task);

    let needs_diagnostic = matches!(report.outcome, Outcome::Partial | Outcome::Failed { .. });
    if needs_diagnostic && !diagnosed {
        task.errors.push(error_at(
            TaskError::new(
                ErrorKind::Internal,
                "attempt ended without reaching success and reported no errors",
                task.attempt,
            ),
            now,
        ));
    }

    match report.outcome {
        Outcome::Success => {
            task.completed_at = Some(now);
            transition(task, TaskStatus::Success, now, None);
        }
        Outcome::Partial => {
            task.completed_at = Some(now);
            transition(task, TaskStatus::Partial, now, None);
        }
        Outcome::Cancelled => {
            task.completed_at = Some(now);
            transition(task, TaskStatus::Cancelled, now, Some("cancel requested".into()));
        }
        Outcome::Failed { retryable } => fail(task, retryable, policy, now),
    }
}

/// `running → failed`, then on to `dlq` or back to `queued`.
fn fail(task: &mut Task, retryable: bool, policy: &RetryPolicy, now: DateTime<Utc>) {
    task.completed_at = Some(now);
    transition(task, TaskStatus::Failed, now, None);

    if task.attempt >= task.max_attempts {
        task.errors.push(error_at(
            TaskError::new(
                ErrorKind::MaxAttemptsExceeded,
                format!("gave up after {} of {} attempts", task.attempt, task.max_attempts),
                task.attempt,
            ),
            now,
        ));
        transition(task, TaskStatus::Dlq, now, None);
    } else if retryable {
        let delay = policy.delay_for_attempt(task.attempt);
        task.scheduled_for = now + delay;
        task.completed_at = None;
        transition(
            task,
            TaskStatus::Queued,
            now,
            Some(format!("retry in {}ms", delay.num_milliseconds())),
        );
    }
}

fn release(task: &mut Task) {
    task.worker_id = None;
    task.lease_expires_at = None;
    task.cancel_requested = false;
}

fn transition(task: &mut Task, to: TaskStatus, now: DateTime<Utc>, reason: Option<String>) {
    debug_assert!(
        can_transition(task.status, to),
        "illegal edge {} -> {}",
        task.status,
        to
    );
    task.history.push(crate::task::StatusChange {
        from: task.status,
        to,
        attempt: task.attempt,
        at: now,
        reason,
    });
    tracing::debug!(task_id = %task.id, from = %task.status, %to, attempt = task.attempt, "Task transition");
    task.status = to;
    task.updated_at = now;
}

fn error_at(mut error: TaskError, now: DateTime<Utc>) -> TaskError {
    error.occurred_at = now;
    error
}
