use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::Mode;
use crate::task::TaskStatus;
use crate::task_queue::TaskQueue;

/// Queue depth and consumers for one mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeMetrics {
    pub mode: Mode,
    /// Queued and due now.
    pub ready: u64,
    /// Queued with `scheduled_for` in the future (retry backoff).
    pub delayed: u64,
    pub running: u64,
    pub consumers: u64,
}

impl ModeMetrics {
    pub fn empty(mode: Mode) -> Self {
        Self {
            mode,
            ready: 0,
            delayed: 0,
            running: 0,
            consumers: 0,
        }
    }
}

/// Raw counts reported by a [`TaskQueue`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueMetrics {
    pub modes: Vec<ModeMetrics>,
    pub by_status: BTreeMap<TaskStatus, u64>,
    /// Mean `completed_at - started_at` over finished attempts.
    pub avg_duration_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub queues: Vec<ModeMetrics>,
    pub tasks_by_status: BTreeMap<TaskStatus, u64>,
    pub total_tasks: u64,
    /// `success / (success + partial + failed + dlq)`; `None` before any task finished.
    pub success_rate: Option<f64>,
    pub avg_duration_ms: Option<f64>,
    pub generated_at: DateTime<Utc>,
}

impl StatsSnapshot {
    pub fn from_metrics(metrics: QueueMetrics, now: DateTime<Utc>) -> Self {
        let queues = Mode::ALL
            .into_iter()
            .map(|mode| {
                metrics
                    .modes
                    .iter()
                    .find(|m| m.mode == mode)
                    .cloned()
                    .unwrap_or_else(|| ModeMetrics::empty(mode))
            })
            .collect();

        let tasks_by_status: BTreeMap<TaskStatus, u64> = TaskStatus::ALL
            .into_iter()
            .map(|s| (s, metrics.by_status.get(&s).copied().unwrap_or(0)))
            .collect();
        let count = |s: TaskStatus| tasks_by_status.get(&s).copied().unwrap_or(0);
        let finished = count(TaskStatus::Success)
            + count(TaskStatus::Partial)
            + count(TaskStatus::Failed)
            + count(TaskStatus::Dlq);
        let success_rate =
            (finished > 0).then(|| count(TaskStatus::Success) as f64 / finished as f64);

        Self {
            queues,
            total_tasks: tasks_by_status.values().sum(),
            tasks_by_status,
            success_rate,
            avg_duration_ms: metrics.avg_duration_ms,
            generated_at: now,
        }
    }
}

/// Read-only view over a queue's counters.
#[derive(Clone)]
pub struct StatsAggregator<Q: TaskQueue> {
    queue: Q,
}

impl<Q: TaskQueue> StatsAggregator<Q> {
    pub fn new(queue: Q) -> Self {
        Self { queue }
    }

    pub async fn snapshot(&self) -> Result<StatsSnapshot, AppError> {
        let metrics = self.queue.metrics().await?;
        Ok(StatsSnapshot::from_metrics(metrics, Utc::now()))
    }
}
