use tokio_util::sync::CancellationToken;

use crate::cache::LoadedSchema;
use crate::error::AppError;
use crate::models::Mode;
use crate::navigation::run_navigation;
use crate::pagination::{ExtractionRun, PageContext, paginate};
use crate::task::Task;
use crate::throttle::SourceRateLimiter;
use crate::traits::{FetchRequest, PageHandle, PageSource, RecordStore};

/// Runs one attempt of a task: acquire → navigate → extract and paginate.
///
/// Generic over the page source and record store so the whole pipeline
/// runs against mocks in tests.
#[derive(Clone)]
pub struct TaskExecutor<P: PageSource, R: RecordStore> {
    source: P,
    records: R,
    limiter: SourceRateLimiter,
}

impl<P: PageSource, R: RecordStore> TaskExecutor<P, R> {
    pub fn new(source: P, records: R, limiter: SourceRateLimiter) -> Self {
        Self {
            source,
            records,
            limiter,
        }
    }

    pub fn mode(&self) -> Mode {
        self.source.mode()
    }

    pub fn records(&self) -> &R {
        &self.records
    }

    /// Execute the attempt, accumulating into `run`.
    ///
    /// Never fails: every problem ends up on `run`, which the caller turns
    /// into an [`crate::task::AttemptReport`].
    pub async fn execute(
        &self,
        task: &Task,
        schema: &LoadedSchema,
        run: &mut ExtractionRun,
        cancel: &CancellationToken,
    ) {
        let def = &schema.schema.definition;

        if self
            .limiter
            .acquire(&task.source_id, def.rate_limit_delay(), cancel)
            .await
            .is_err()
        {
            run.cancel();
            return;
        }

        tracing::info!(task_id = %task.id, url = %task.target_url, mode = %self.mode(), "Acquiring page");
        let request = FetchRequest::for_schema(task.target_url.as_str(), def);
        let mut page = match self.source.acquire(&request).await {
            Ok(page) => page,
            Err(AppError::Cancelled) => {
                run.cancel();
                return;
            }
            Err(e) => {
                run.page_failed(1, &e);
                return;
            }
        };

        if !def.navigation.is_empty() {
            if self.mode() == Mode::Browser {
                match run_navigation(&mut page, &def.navigation, cancel).await {
                    Ok(()) => {}
                    Err(AppError::Cancelled) => {
                        run.cancel();
                        page.close().await;
                        return;
                    }
                    Err(e) => {
                        run.fail(&e, Some(1));
                        page.close().await;
                        return;
                    }
                }
            } else {
                tracing::debug!(
                    task_id = %task.id,
                    steps = def.navigation.len(),
                    "Skipping navigation in http mode"
                );
            }
        }

        let ctx = PageContext {
            task,
            schema,
            records: &self.records,
            limiter: &self.limiter,
            cancel,
        };
        paginate(&mut page, &ctx, run).await;
        page.close().await;

        tracing::info!(
            task_id = %task.id,
            pages = run.pages,
            records = run.records_found,
            rejected = run.records_rejected,
            errors = run.errors.len(),
            "Attempt finished"
        );
    }
}
