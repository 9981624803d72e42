use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::SchemaCache;
use crate::callback::{CallbackPolicy, deliver_callback};
use crate::error::AppError;
use crate::executor::TaskExecutor;
use crate::models::{Mode, TaskError};
use crate::pagination::ExtractionRun;
use crate::task::{AttemptReport, Task, TaskStatus};
use crate::task_queue::TaskQueue;
use crate::traits::{Notifier, PageSource, RecordStore, SchemaStore};

/// How long a timed-out attempt gets to wind down after its token fires.
const TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
        mode: Mode,
    },
    Polling,
    TaskClaimed {
        task: &'a Task,
    },
    CancelRequested {
        task_id: Uuid,
    },
    LeaseLost {
        task_id: Uuid,
    },
    TaskFinished {
        task: &'a Task,
    },
    ShuttingDown {
        worker_id: &'a str,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id, mode } => {
                tracing::info!(%worker_id, %mode, "Worker started");
            }
            WorkerEvent::Polling => {
                tracing::trace!("Polling for tasks");
            }
            WorkerEvent::TaskClaimed { task } => {
                tracing::info!(
                    task_id = %task.id,
                    url = %task.target_url,
                    attempt = task.attempt,
                    max_attempts = task.max_attempts,
                    "Task claimed"
                );
            }
            WorkerEvent::CancelRequested { task_id } => {
                tracing::info!(%task_id, "Cancel requested, stopping at next checkpoint");
            }
            WorkerEvent::LeaseLost { task_id } => {
                tracing::warn!(%task_id, "Lease lost, abandoning attempt");
            }
            WorkerEvent::TaskFinished { task } => {
                let last_error = task.errors.last().map(|e| e.message.as_str()).unwrap_or("");
                match task.status {
                    TaskStatus::Success | TaskStatus::Cancelled => tracing::info!(
                        task_id = %task.id,
                        status = %task.status,
                        records = task.records_extracted,
                        "Task finished"
                    ),
                    TaskStatus::Partial => tracing::warn!(
                        task_id = %task.id,
                        records = task.records_extracted,
                        errors = task.errors.len(),
                        "Task finished with errors"
                    ),
                    TaskStatus::Queued => tracing::warn!(
                        task_id = %task.id,
                        attempt = task.attempt,
                        retry_at = %task.scheduled_for,
                        error = %last_error,
                        "Attempt failed, will retry"
                    ),
                    TaskStatus::Dlq => tracing::error!(
                        task_id = %task.id,
                        attempt = task.attempt,
                        error = %last_error,
                        "Task moved to dead-letter queue"
                    ),
                    _ => tracing::warn!(
                        task_id = %task.id,
                        status = %task.status,
                        error = %last_error,
                        "Task failed"
                    ),
                }
            }
            WorkerEvent::ShuttingDown { worker_id } => {
                tracing::info!(%worker_id, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
    /// Lease granted on claim and on every heartbeat.
    pub lease: Duration,
    pub heartbeat_interval: Duration,
    /// Wall-clock limit of one attempt.
    pub task_timeout: Duration,
    pub callback: CallbackPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            poll_interval: Duration::from_secs(1),
            lease: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            task_timeout: Duration::from_secs(300),
            callback: CallbackPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease(mut self, lease: Duration, heartbeat_interval: Duration) -> Self {
        self.lease = lease;
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }
}

/// Worker that polls one mode's queue and runs tasks one at a time.
pub struct Worker<Q, S, P, R, N>
where
    Q: TaskQueue,
    S: SchemaStore,
    P: PageSource,
    R: RecordStore,
    N: Notifier,
{
    queue: Q,
    schemas: S,
    executor: TaskExecutor<P, R>,
    notifier: N,
    cache: SchemaCache,
    config: WorkerConfig,
}

impl<Q, S, P, R, N> Worker<Q, S, P, R, N>
where
    Q: TaskQueue,
    S: SchemaStore,
    P: PageSource,
    R: RecordStore,
    N: Notifier,
{
    pub fn new(
        queue: Q,
        schemas: S,
        executor: TaskExecutor<P, R>,
        notifier: N,
        cache: SchemaCache,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            schemas,
            executor,
            notifier,
            cache,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run the worker loop until `shutdown` fires.
    ///
    /// Shutdown is checked between tasks only; an attempt in flight runs
    /// to completion and is landed normally.
    pub async fn run<WR: WorkerReporter>(
        &self,
        shutdown: CancellationToken,
        reporter: &WR,
    ) -> Result<(), AppError> {
        let worker_id = self.config.worker_id.as_str();
        let mode = self.executor.mode();
        self.queue.register_worker(worker_id, mode).await?;
        reporter.report(WorkerEvent::Started { worker_id, mode });

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            reporter.report(WorkerEvent::Polling);

            match self.process_next(reporter).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                        () = shutdown.cancelled() => break,
                    }
                }
                Err(e) => {
                    tracing::error!(%worker_id, error = %e, "Failed to claim task");
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        () = shutdown.cancelled() => break,
                    }
                }
            }
        }

        reporter.report(WorkerEvent::ShuttingDown { worker_id });
        if let Err(e) = self.queue.deregister_worker(worker_id).await {
            tracing::warn!(%worker_id, error = %e, "Failed to deregister worker");
        }
        reporter.report(WorkerEvent::Stopped { worker_id });
        Ok(())
    }

    /// Claim and run one task. Returns the task as landed, or `None`
    /// when nothing was ready.
    pub async fn process_next<WR: WorkerReporter>(
        &self,
        reporter: &WR,
    ) -> Result<Option<Task>, AppError> {
        let claimed = self
            .queue
            .claim_next(self.executor.mode(), &self.config.worker_id, self.config.lease)
            .await?;
        let Some(task) = claimed else {
            return Ok(None);
        };
        reporter.report(WorkerEvent::TaskClaimed { task: &task });

        let report = self.attempt(&task, reporter).await;
        match self.queue.finish(task.id, &self.config.worker_id, report).await {
            Ok(landed) => {
                reporter.report(WorkerEvent::TaskFinished { task: &landed });
                if landed.status.is_terminal() {
                    deliver_callback(&self.notifier, &landed, &self.config.callback).await;
                }
                Ok(Some(landed))
            }
            Err(e) => {
                // lease reclaimed meanwhile; the reclaimer already landed it
                tracing::error!(task_id = %task.id, error = %e, "Failed to land attempt");
                Ok(Some(task))
            }
        }
    }

    async fn attempt<WR: WorkerReporter>(&self, task: &Task, reporter: &WR) -> AttemptReport {
        let schema = match self
            .cache
            .load(&self.schemas, &task.schema_id, task.schema_version)
            .await
        {
            Ok(schema) => schema,
            Err(e) => {
                let error = TaskError::new(e.error_kind(), e.to_string(), task.attempt);
                return AttemptReport::failed(error, e.is_retryable());
            }
        };

        let attempt_token = CancellationToken::new();
        let done = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.queue.clone(),
            task.id,
            self.config.worker_id.clone(),
            self.config.lease,
            self.config.heartbeat_interval,
            attempt_token.clone(),
            done.clone(),
        ));

        let mut run = ExtractionRun::new(task.attempt);
        let timed_out = {
            let exec = self.executor.execute(task, &schema, &mut run, &attempt_token);
            tokio::pin!(exec);
            tokio::select! {
                () = &mut exec => false,
                () = tokio::time::sleep(self.config.task_timeout) => {
                    attempt_token.cancel();
                    let _ = tokio::time::timeout(TIMEOUT_GRACE, exec).await;
                    true
                }
            }
        };
        if timed_out {
            run.timed_out(self.config.task_timeout.as_secs());
        }

        done.cancel();
        match heartbeat.await {
            Ok(HeartbeatEnd::CancelRequested) => {
                reporter.report(WorkerEvent::CancelRequested { task_id: task.id });
            }
            Ok(HeartbeatEnd::LeaseLost) => {
                reporter.report(WorkerEvent::LeaseLost { task_id: task.id });
            }
            Ok(HeartbeatEnd::Done) => {}
            Err(e) => tracing::error!(task_id = %task.id, error = %e, "Heartbeat task panicked"),
        }
        run.into_report()
    }
}

enum HeartbeatEnd {
    Done,
    CancelRequested,
    LeaseLost,
}

/// Renew the lease until `done` fires; trips `attempt` on a cancel request
/// or when the task was taken away.
async fn heartbeat_loop<Q: TaskQueue>(
    queue: Q,
    task_id: Uuid,
    worker_id: String,
    lease: Duration,
    interval: Duration,
    attempt: CancellationToken,
    done: CancellationToken,
) -> HeartbeatEnd {
    let mut end = HeartbeatEnd::Done;
    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = done.cancelled() => return end,
        }
        match queue.heartbeat(task_id, &worker_id, lease).await {
            Ok(true) => {
                if !attempt.is_cancelled() {
                    attempt.cancel();
                    end = HeartbeatEnd::CancelRequested;
                }
            }
            Ok(false) => {}
            Err(AppError::Conflict(_) | AppError::NotFound(_)) => {
                attempt.cancel();
                return HeartbeatEnd::LeaseLost;
            }
            Err(e) => {
                tracing::warn!(%task_id, error = %e, "Heartbeat failed");
            }
        }
    }
}
