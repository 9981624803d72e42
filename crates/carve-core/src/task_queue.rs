use std::future::Future;
use std::time::Duration;

use uuid::Uuid;

use crate::error::AppError;
use crate::models::Mode;
use crate::stats::QueueMetrics;
use crate::task::{AttemptReport, NewTask, Task, TaskFilter, TaskPage};

/// A registered worker that has not polled or heartbeated for this long
/// no longer counts as a consumer and is pruned by `reclaim_expired`.
pub const WORKER_TTL: Duration = Duration::from_secs(120);

/// Durable, priority-ordered task queue partitioned by mode.
///
/// Implementations own the retry policy and must make every status change
/// atomic: `claim_next` in particular must hand a task to exactly one
/// worker (`SELECT ... FOR UPDATE SKIP LOCKED` or equivalent). Ready tasks
/// are served by `(priority, scheduled_for, submission order)`.
pub trait TaskQueue: Send + Sync + Clone + 'static {
    /// Persist a new task and admit it to its mode's queue.
    fn enqueue(&self, task: NewTask) -> impl Future<Output = Result<Task, AppError>> + Send;

    /// Atomically claim the next ready task of `mode`, starting a new attempt.
    /// Also marks `worker_id` as seen.
    ///
    /// Returns `None` if no task is ready.
    fn claim_next(
        &self,
        mode: Mode,
        worker_id: &str,
        lease: Duration,
    ) -> impl Future<Output = Result<Option<Task>, AppError>> + Send;

    /// Extend the lease of a running task and mark the worker as seen.
    /// Returns whether a cancel was requested; fails with `Conflict` when
    /// the worker lost the task.
    fn heartbeat(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Land the result of an attempt.
    fn finish(
        &self,
        task_id: Uuid,
        worker_id: &str,
        report: AttemptReport,
    ) -> impl Future<Output = Result<Task, AppError>> + Send;

    /// Operator retry; valid from `failed` and `dlq` only.
    fn retry(&self, task_id: Uuid) -> impl Future<Output = Result<Task, AppError>> + Send;

    /// Operator cancel. Pending and queued tasks are cancelled at once;
    /// running tasks are flagged and stop at their next checkpoint.
    fn cancel(&self, task_id: Uuid) -> impl Future<Output = Result<Task, AppError>> + Send;

    /// Fail every running task whose lease has expired (retryable) and
    /// drop worker registrations older than the worker TTL.
    fn reclaim_expired(&self) -> impl Future<Output = Result<Vec<Task>, AppError>> + Send;

    fn get_task(
        &self,
        task_id: Uuid,
    ) -> impl Future<Output = Result<Option<Task>, AppError>> + Send;

    fn list_tasks(
        &self,
        filter: &TaskFilter,
    ) -> impl Future<Output = Result<TaskPage, AppError>> + Send;

    /// Announce a consumer of `mode` (for queue stats).
    fn register_worker(
        &self,
        worker_id: &str,
        mode: Mode,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn deregister_worker(&self, worker_id: &str)
    -> impl Future<Output = Result<(), AppError>> + Send;

    /// Raw counts for the stats aggregator.
    fn metrics(&self) -> impl Future<Output = Result<QueueMetrics, AppError>> + Send;

    /// Check that the backing store answers.
    fn ping(&self) -> impl Future<Output = Result<(), AppError>> + Send {
        async { Ok(()) }
    }
}
