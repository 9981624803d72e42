//! Operation layer shared by the REST server and the CLI.
//!
//! Validates requests against the stores and turns missing rows into
//! `NotFound`, so front ends only map errors to their own surface.

use std::collections::BTreeSet;

use serde::Serialize;
use uuid::Uuid;

use crate::callback::{CallbackPolicy, deliver_callback};
use crate::error::AppError;
use crate::models::ExtractedRecord;
use crate::resolver::{CompiledSchema, extract_page};
use crate::schema::{NewSchema, ParsingSchema, SchemaDefinition, SchemaFilter};
use crate::task::{CreateTaskRequest, NewTask, Task, TaskFilter, TaskPage};
use crate::task_queue::TaskQueue;
use crate::traits::{FetchRequest, Fetcher, Notifier, RecordStore, SchemaStore};

/// Most URLs a single dry run may fetch.
pub const MAX_DRY_RUN_URLS: usize = 5;

/// Outcome of running a schema against one sample URL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UrlCheck {
    pub url: String,
    /// At least one record was extracted.
    pub success: bool,
    pub records_found: usize,
    pub records_rejected: u32,
    /// Fields populated in at least one record.
    pub fields_extracted: Vec<String>,
    pub errors: Vec<String>,
}

/// Result of a dry run; nothing is persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DryRunReport {
    pub schema_id: String,
    pub version: u32,
    pub results: Vec<UrlCheck>,
    pub overall_success: bool,
}

#[derive(Clone)]
pub struct SchemaService<S: SchemaStore> {
    store: S,
}

impl<S: SchemaStore> SchemaService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn create(&self, schema: NewSchema) -> Result<ParsingSchema, AppError> {
        schema.validate()?;
        let created = self.store.create_schema(schema).await?;
        tracing::info!(
            schema_id = %created.schema_id,
            source_id = %created.source_id,
            "Schema created"
        );
        Ok(created)
    }

    /// Publish `definition` as the next version of `schema_id`.
    pub async fn publish(&self, schema_id: &str, definition: SchemaDefinition) -> Result<ParsingSchema, AppError> {
        definition.validate()?;
        let published = self.store.publish_version(schema_id, definition).await?;
        tracing::info!(%schema_id, version = published.version, "Schema version published");
        Ok(published)
    }

    /// Create the schema, or publish a new version when it already exists.
    pub async fn upsert(&self, schema: NewSchema) -> Result<ParsingSchema, AppError> {
        schema.validate()?;
        match self.store.get_schema(&schema.schema_id, None).await? {
            Some(existing) if existing.source_id != schema.source_id => Err(AppError::ValidationError(format!(
                "schema '{}' belongs to source '{}'",
                existing.schema_id, existing.source_id
            ))),
            Some(_) => self.publish(&schema.schema_id, schema.definition).await,
            None => self.create(schema).await,
        }
    }

    pub async fn get(&self, schema_id: &str, version: Option<u32>) -> Result<ParsingSchema, AppError> {
        self.store
            .get_schema(schema_id, version)
            .await?
            .ok_or_else(|| match version {
                Some(v) => AppError::NotFound(format!("schema {schema_id} v{v}")),
                None => AppError::NotFound(format!("schema {schema_id}")),
            })
    }

    pub async fn list(&self, filter: &SchemaFilter) -> Result<Vec<ParsingSchema>, AppError> {
        self.store.list_schemas(filter).await
    }

    pub async fn deactivate(&self, schema_id: &str) -> Result<(), AppError> {
        self.store.deactivate_schema(schema_id).await?;
        tracing::info!(%schema_id, "Schema deactivated");
        Ok(())
    }

    /// Every published version, oldest first.
    pub async fn versions(&self, schema_id: &str) -> Result<Vec<ParsingSchema>, AppError> {
        let versions = self.store.list_versions(schema_id).await?;
        if versions.is_empty() {
            return Err(AppError::NotFound(format!("schema {schema_id}")));
        }
        Ok(versions)
    }

    /// Reactivate a schema without publishing a new version.
    pub async fn activate(&self, schema_id: &str) -> Result<ParsingSchema, AppError> {
        self.store.activate_schema(schema_id).await?;
        tracing::info!(%schema_id, "Schema activated");
        self.get(schema_id, None).await
    }

    /// Fetch each URL and run the schema over it without storing anything.
    pub async fn dry_run<F: Fetcher>(
        &self,
        fetcher: &F,
        schema_id: &str,
        version: Option<u32>,
        urls: &[String],
    ) -> Result<DryRunReport, AppError> {
        if urls.is_empty() {
            return Err(AppError::ValidationError("at least one URL is required".into()));
        }
        if urls.len() > MAX_DRY_RUN_URLS {
            return Err(AppError::ValidationError(format!(
                "at most {MAX_DRY_RUN_URLS} URLs per dry run, got {}",
                urls.len()
            )));
        }
        let schema = self.get(schema_id, version).await?;
        let compiled = CompiledSchema::compile(&schema.definition)?;

        let mut results = Vec::with_capacity(urls.len());
        for url in urls {
            let check = match fetcher.fetch(&FetchRequest::for_schema(url, &schema.definition)).await {
                Ok(html) => {
                    let page = extract_page(&compiled, &html, url);
                    let fields: BTreeSet<String> = page
                        .records
                        .iter()
                        .filter_map(|r| r.as_object())
                        .flat_map(|obj| obj.iter().filter(|(_, v)| !v.is_null()).map(|(k, _)| k.clone()))
                        .collect();
                    UrlCheck {
                        url: url.clone(),
                        success: !page.records.is_empty(),
                        records_found: page.records.len(),
                        records_rejected: page.rejected,
                        fields_extracted: fields.into_iter().collect(),
                        errors: page
                            .errors
                            .iter()
                            .map(|e| format!("{}: {}", e.field, e.message))
                            .collect(),
                    }
                }
                Err(e) => UrlCheck {
                    url: url.clone(),
                    success: false,
                    records_found: 0,
                    records_rejected: 0,
                    fields_extracted: Vec::new(),
                    errors: vec![e.to_string()],
                },
            };
            tracing::debug!(%schema_id, url = %check.url, records = check.records_found, "Dry run checked URL");
            results.push(check);
        }

        let overall_success = results.iter().all(|r| r.success);
        tracing::info!(%schema_id, version = schema.version, urls = results.len(), overall_success, "Dry run finished");
        Ok(DryRunReport {
            schema_id: schema.schema_id,
            version: schema.version,
            results,
            overall_success,
        })
    }
}

#[derive(Clone)]
pub struct TaskService<Q: TaskQueue, S: SchemaStore, R: RecordStore, N: Notifier> {
    queue: Q,
    schemas: S,
    records: R,
    notifier: N,
    callback: CallbackPolicy,
    detach_callbacks: bool,
}

impl<Q: TaskQueue, S: SchemaStore, R: RecordStore, N: Notifier> TaskService<Q, S, R, N> {
    pub fn new(queue: Q, schemas: S, records: R, notifier: N) -> Self {
        Self {
            queue,
            schemas,
            records,
            notifier,
            callback: CallbackPolicy::default(),
            detach_callbacks: true,
        }
    }

    pub fn with_callback_policy(mut self, policy: CallbackPolicy) -> Self {
        self.callback = policy;
        self
    }

    /// Deliver callbacks before `cancel` returns instead of in a spawned
    /// task. Short-lived processes need this or the callback is dropped.
    pub fn with_inline_callbacks(mut self) -> Self {
        self.detach_callbacks = false;
        self
    }

    /// Validate the request against its schema and enqueue it.
    ///
    /// The task is bound to the requested version, or the latest one. A
    /// schema with `requires_javascript` forces browser mode.
    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<Task, AppError> {
        request.validate()?;
        let schema = self
            .schemas
            .get_schema(&request.schema_id, request.schema_version)
            .await?
            .ok_or_else(|| match request.schema_version {
                Some(v) => AppError::NotFound(format!("schema {} v{v}", request.schema_id)),
                None => AppError::NotFound(format!("schema {}", request.schema_id)),
            })?;

        if !schema.is_active {
            return Err(AppError::ValidationError(format!(
                "schema '{}' is not active",
                schema.schema_id
            )));
        }
        if schema.source_id != request.source_id {
            return Err(AppError::ValidationError(format!(
                "schema '{}' belongs to source '{}', not '{}'",
                schema.schema_id, schema.source_id, request.source_id
            )));
        }
        if !schema.definition.matches_url(&request.target_url)? {
            return Err(AppError::ValidationError(format!(
                "target_url '{}' matches none of the schema's url_patterns",
                request.target_url
            )));
        }

        let mode = schema.definition.effective_mode(request.mode);
        if mode != request.mode {
            tracing::info!(schema_id = %schema.schema_id, %mode, "Schema requires javascript, using browser mode");
        }
        let task = self
            .queue
            .enqueue(NewTask {
                source_id: request.source_id,
                schema_id: schema.schema_id,
                schema_version: schema.version,
                target_url: request.target_url,
                mode,
                priority: request.priority,
                max_attempts: request.max_attempts,
                callback_url: request.callback_url,
                scheduled_for: request.scheduled_for,
            })
            .await?;
        tracing::info!(task_id = %task.id, url = %task.target_url, %mode, "Task queued");
        Ok(task)
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Task, AppError> {
        self.queue
            .get_task(task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<TaskPage, AppError> {
        self.queue.list_tasks(filter).await
    }

    pub async fn retry(&self, task_id: Uuid) -> Result<Task, AppError> {
        let task = self.queue.retry(task_id).await?;
        tracing::info!(%task_id, attempt = task.attempt, "Task requeued by operator");
        Ok(task)
    }

    /// Cancel a task. A task that is not running lands in `cancelled`
    /// right away and its callback is sent here; a running one is only
    /// flagged and its worker reports the terminal state.
    pub async fn cancel(&self, task_id: Uuid) -> Result<Task, AppError> {
        let task = self.queue.cancel(task_id).await?;
        tracing::info!(%task_id, status = %task.status, "Task cancel accepted");
        if task.status.is_terminal() && task.callback_url.is_some() {
            if self.detach_callbacks {
                let notifier = self.notifier.clone();
                let policy = self.callback.clone();
                let landed = task.clone();
                tokio::spawn(async move {
                    deliver_callback(&notifier, &landed, &policy).await;
                });
            } else {
                deliver_callback(&self.notifier, &task, &self.callback).await;
            }
        }
        Ok(task)
    }

    pub async fn records(&self, task_id: Uuid, limit: usize, offset: usize) -> Result<Vec<ExtractedRecord>, AppError> {
        self.get_task(task_id).await?;
        self.records.list_records(task_id, limit, offset).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRecordStore, MemoryStore};
    use crate::models::Mode;
    use crate::schema::FieldDefinition;
    use crate::task::TaskStatus;
    use crate::testutil::{MockFetcher, MockNotifier, listing_page};
    use std::time::Duration;

    fn definition() -> SchemaDefinition {
        let mut def = SchemaDefinition::new(vec![FieldDefinition::new("title", "h1")]);
        def.url_patterns = vec![r"^https://shop\.test/".into()];
        def
    }

    type Tasks = TaskService<MemoryStore, MemoryStore, MemoryRecordStore, MockNotifier>;

    async fn services_with(notifier: MockNotifier) -> (SchemaService<MemoryStore>, Tasks) {
        let store = MemoryStore::new();
        let schemas = SchemaService::new(store.clone());
        schemas
            .create(NewSchema::new("listing", "shop", definition()))
            .await
            .unwrap();
        let tasks = TaskService::new(store.clone(), store, MemoryRecordStore::new(), notifier);
        (schemas, tasks)
    }

    async fn services() -> (SchemaService<MemoryStore>, Tasks) {
        services_with(MockNotifier::new()).await
    }

    #[tokio::test]
    async fn task_binds_latest_version() {
        let (schemas, tasks) = services().await;
        schemas.publish("listing", definition()).await.unwrap();

        let task = tasks
            .create_task(CreateTaskRequest::new("shop", "listing", "https://shop.test/list"))
            .await
            .unwrap();
        assert_eq!(task.schema_version, 2);
        assert_eq!(task.status, TaskStatus::Queued);

        let pinned = tasks
            .create_task(CreateTaskRequest::new("shop", "listing", "https://shop.test/list").with_schema_version(1))
            .await
            .unwrap();
        assert_eq!(pinned.schema_version, 1);
    }

    #[tokio::test]
    async fn rejects_bad_requests() {
        let (schemas, tasks) = services().await;
        let wrong_url = tasks
            .create_task(CreateTaskRequest::new("shop", "listing", "https://elsewhere.test/"))
            .await;
        assert!(matches!(wrong_url, Err(AppError::ValidationError(_))));

        let wrong_source = tasks
            .create_task(CreateTaskRequest::new("books", "listing", "https://shop.test/"))
            .await;
        assert!(matches!(wrong_source, Err(AppError::ValidationError(_))));

        let missing = tasks
            .create_task(CreateTaskRequest::new("shop", "nope", "https://shop.test/"))
            .await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));

        schemas.deactivate("listing").await.unwrap();
        let inactive = tasks
            .create_task(CreateTaskRequest::new("shop", "listing", "https://shop.test/"))
            .await;
        assert!(matches!(inactive, Err(AppError::ValidationError(_))));
    }

    #[tokio::test]
    async fn javascript_schema_forces_browser_mode() {
        let (schemas, tasks) = services().await;
        let mut def = definition();
        def.requires_javascript = true;
        schemas.publish("listing", def).await.unwrap();

        let task = tasks
            .create_task(CreateTaskRequest::new("shop", "listing", "https://shop.test/spa"))
            .await
            .unwrap();
        assert_eq!(task.mode, Mode::Browser);
    }

    #[tokio::test]
    async fn cancel_and_retry_respect_status() {
        let (_, tasks) = services().await;
        let task = tasks
            .create_task(CreateTaskRequest::new("shop", "listing", "https://shop.test/"))
            .await
            .unwrap();
        assert!(matches!(
            tasks.retry(task.id).await,
            Err(AppError::InvalidTransition { .. })
        ));
        let cancelled = tasks.cancel(task.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(matches!(
            tasks.cancel(task.id).await,
            Err(AppError::InvalidTransition { .. })
        ));
        assert!(matches!(
            tasks.get_task(uuid::Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn upsert_creates_then_publishes() {
        let (schemas, _) = services().await;
        let v2 = schemas
            .upsert(NewSchema::new("listing", "shop", definition()))
            .await
            .unwrap();
        assert_eq!(v2.version, 2);
        let fresh = schemas
            .upsert(NewSchema::new("detail", "shop", definition()))
            .await
            .unwrap();
        assert_eq!(fresh.version, 1);
        assert!(
            schemas
                .upsert(NewSchema::new("listing", "books", definition()))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn cancelling_a_queued_task_sends_its_callback() {
        let notifier = MockNotifier::new();
        let (_, tasks) = services_with(notifier.clone()).await;
        let task = tasks
            .create_task(
                CreateTaskRequest::new("shop", "listing", "https://shop.test/")
                    .with_callback_url("https://hooks.test/done"),
            )
            .await
            .unwrap();
        tasks.cancel(task.id).await.unwrap();

        for _ in 0..50 {
            if !notifier.calls().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let calls = notifier.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "https://hooks.test/done");
        assert_eq!(calls[0].1.task_id, task.id);
        assert_eq!(calls[0].1.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn inline_callbacks_are_delivered_before_cancel_returns() {
        let notifier = MockNotifier::new();
        let (_, tasks) = services_with(notifier.clone()).await;
        let tasks = tasks.with_inline_callbacks();
        let task = tasks
            .create_task(
                CreateTaskRequest::new("shop", "listing", "https://shop.test/")
                    .with_callback_url("https://hooks.test/done"),
            )
            .await
            .unwrap();
        tasks.cancel(task.id).await.unwrap();
        assert_eq!(notifier.calls().len(), 1);
    }

    #[tokio::test]
    async fn cancel_without_callback_url_notifies_nobody() {
        let notifier = MockNotifier::new();
        let (_, tasks) = services_with(notifier.clone()).await;
        let task = tasks
            .create_task(CreateTaskRequest::new("shop", "listing", "https://shop.test/"))
            .await
            .unwrap();
        tasks.cancel(task.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(notifier.calls().is_empty());
    }

    #[tokio::test]
    async fn versions_and_reactivation() {
        let (schemas, tasks) = services().await;
        schemas.publish("listing", definition()).await.unwrap();
        let versions = schemas.versions("listing").await.unwrap();
        assert_eq!(versions.iter().map(|v| v.version).collect::<Vec<_>>(), [1, 2]);
        assert!(matches!(schemas.versions("nope").await, Err(AppError::NotFound(_))));

        schemas.deactivate("listing").await.unwrap();
        let active = schemas.activate("listing").await.unwrap();
        assert!(active.is_active);
        assert_eq!(active.version, 2);
        tasks
            .create_task(CreateTaskRequest::new("shop", "listing", "https://shop.test/"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dry_run_reports_each_url_without_storing() {
        let (schemas, tasks) = services().await;
        let mut def = SchemaDefinition::new(vec![
            FieldDefinition::new("title", "h2"),
            FieldDefinition::new("link", "a").with_attribute("href"),
        ]);
        def.container_selector = Some("div.item".into());
        schemas.publish("listing", def).await.unwrap();

        let fetcher = MockFetcher::new()
            .with_page("https://shop.test/a", &listing_page(1, 3))
            .with_page("https://shop.test/empty", "<html><body></body></html>")
            .with_status("https://shop.test/gone", 410);
        let urls: Vec<String> = ["a", "empty", "gone"]
            .iter()
            .map(|p| format!("https://shop.test/{p}"))
            .collect();
        let report = schemas.dry_run(&fetcher, "listing", None, &urls).await.unwrap();

        assert_eq!(report.version, 2);
        assert!(!report.overall_success);
        assert!(report.results[0].success);
        assert_eq!(report.results[0].records_found, 3);
        assert_eq!(report.results[0].fields_extracted, ["link", "title"]);
        assert!(!report.results[1].success);
        assert_eq!(report.results[1].records_found, 0);
        assert!(report.results[2].errors[0].contains("410"));
        assert_eq!(fetcher.fetched_urls(), urls);

        let listed = tasks.list_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(listed.total, 0);
    }

    #[tokio::test]
    async fn dry_run_rejects_empty_or_oversized_url_lists() {
        let (schemas, _) = services().await;
        let fetcher = MockFetcher::new();
        let none = schemas.dry_run(&fetcher, "listing", None, &[]).await;
        assert!(matches!(none, Err(AppError::ValidationError(_))));

        let many: Vec<String> = (0..=MAX_DRY_RUN_URLS)
            .map(|i| format!("https://shop.test/{i}"))
            .collect();
        let too_many = schemas.dry_run(&fetcher, "listing", None, &many).await;
        assert!(matches!(too_many, Err(AppError::ValidationError(_))));
        assert!(fetcher.fetched_urls().is_empty());

        let missing = schemas
            .dry_run(&fetcher, "nope", None, &["https://shop.test/".to_string()])
            .await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }
}
