use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::SchemaCache;
use crate::callback::{CallbackPolicy, deliver_callback};
use crate::config::DispatcherConfig;
use crate::executor::TaskExecutor;
use crate::task_queue::TaskQueue;
use crate::throttle::SourceRateLimiter;
use crate::traits::{Notifier, PageSource, RecordStore, SchemaStore};
use crate::worker::{TracingWorkerReporter, Worker};

/// Owns the worker pools of one process.
///
/// Pools share the queue, the schema cache, the per-source rate limiter and
/// one shutdown token. A lease reclaimer sweeps tasks whose worker died.
pub struct Dispatcher<Q, S, R, N>
where
    Q: TaskQueue,
    S: SchemaStore,
    R: RecordStore,
    N: Notifier,
{
    queue: Q,
    schemas: S,
    records: R,
    notifier: N,
    limiter: SourceRateLimiter,
    cache: SchemaCache,
    config: DispatcherConfig,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl<Q, S, R, N> Dispatcher<Q, S, R, N>
where
    Q: TaskQueue,
    S: SchemaStore,
    R: RecordStore,
    N: Notifier,
{
    pub fn new(queue: Q, schemas: S, records: R, notifier: N, config: DispatcherConfig) -> Self {
        Self {
            queue,
            schemas,
            records,
            notifier,
            limiter: SourceRateLimiter::new(),
            cache: SchemaCache::default(),
            config,
            shutdown: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn with_limiter(mut self, limiter: SourceRateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Cancelling this token stops every pool after its current task.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start `count` workers pulling from `source`'s mode queue.
    pub fn spawn_pool<P: PageSource>(&mut self, source: P, count: usize) {
        let mode = source.mode();
        let process = Uuid::new_v4().simple().to_string();
        let process = &process[..8];
        for i in 0..count {
            let worker = Worker::new(
                self.queue.clone(),
                self.schemas.clone(),
                TaskExecutor::new(source.clone(), self.records.clone(), self.limiter.clone()),
                self.notifier.clone(),
                self.cache.clone(),
                self.config.worker_config(format!("{mode}-{process}-{i}")),
            );
            let shutdown = self.shutdown.clone();
            self.tasks.spawn(async move {
                if let Err(e) = worker.run(shutdown, &TracingWorkerReporter).await {
                    tracing::error!(worker_id = %worker.worker_id(), error = %e, "Worker exited with error");
                }
            });
        }
        tracing::info!(%mode, workers = count, "Worker pool started");
    }

    /// Start the lease reclaimer.
    pub fn spawn_reclaimer(&mut self) {
        let queue = self.queue.clone();
        let notifier = self.notifier.clone();
        let shutdown = self.shutdown.clone();
        let interval = self.config.reclaim_interval;
        self.tasks.spawn(async move {
            let policy = CallbackPolicy::default();
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = shutdown.cancelled() => break,
                }
                match queue.reclaim_expired().await {
                    Ok(reclaimed) => {
                        for task in reclaimed {
                            tracing::warn!(
                                task_id = %task.id,
                                status = %task.status,
                                attempt = task.attempt,
                                "Reclaimed task with expired lease"
                            );
                            if task.status.is_terminal() {
                                deliver_callback(&notifier, &task, &policy).await;
                            }
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Lease reclaim failed"),
                }
            }
        });
    }

    /// Wait for the shutdown token, then for every worker to finish its
    /// current task.
    pub async fn run(mut self) {
        self.shutdown.cancelled().await;
        tracing::info!(workers = self.tasks.len(), "Waiting for workers to drain");
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        tracing::info!("Dispatcher stopped");
    }
}
