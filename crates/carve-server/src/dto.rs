use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use carve_core::error::AppError;
use carve_core::models::{ExtractedRecord, TaskError};
use carve_core::schema::{NewSchema, ParsingSchema, SchemaDefinition, SchemaFilter};
use carve_core::service::{DryRunReport, UrlCheck};
use carve_core::stats::{ModeMetrics, StatsSnapshot};
use carve_core::task::{CreateTaskRequest as NewTaskRequest, StatusChange, Task, TaskFilter};

const MAX_PAGE_SIZE: usize = 500;

fn parse_field<T: std::str::FromStr<Err = String>>(raw: Option<String>) -> Result<Option<T>, AppError> {
    raw.map(|s| s.parse().map_err(AppError::ValidationError)).transpose()
}

// ---------------------------------------------------------------------------
// Schemas
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateSchemaRequest {
    /// Stable identifier (e.g. "shop_listing")
    pub schema_id: String,
    /// Site the schema extracts from; one active schema per source
    pub source_id: String,
    /// Fields, selectors, navigation and pagination rules
    #[schema(value_type = Object)]
    pub definition: SchemaDefinition,
}

impl From<CreateSchemaRequest> for NewSchema {
    fn from(body: CreateSchemaRequest) -> Self {
        NewSchema::new(body.schema_id, body.source_id, body.definition)
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct PublishSchemaRequest {
    #[schema(value_type = Object)]
    pub definition: SchemaDefinition,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SchemaResponse {
    pub schema_id: String,
    pub source_id: String,
    pub version: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[schema(value_type = Object)]
    pub definition: SchemaDefinition,
}

impl From<ParsingSchema> for SchemaResponse {
    fn from(schema: ParsingSchema) -> Self {
        Self {
            schema_id: schema.schema_id,
            source_id: schema.source_id,
            version: schema.version,
            is_active: schema.is_active,
            created_at: schema.created_at,
            definition: schema.definition,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct GetSchemaQuery {
    /// Specific version; latest when omitted
    pub version: Option<u32>,
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListSchemasQuery {
    pub source_id: Option<String>,
    pub active_only: Option<bool>,
}

impl From<ListSchemasQuery> for SchemaFilter {
    fn from(query: ListSchemasQuery) -> Self {
        SchemaFilter {
            source_id: query.source_id,
            active_only: query.active_only.unwrap_or(false),
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SchemaListResponse {
    pub schemas: Vec<SchemaResponse>,
    pub total: usize,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ValidateSchemaRequest {
    /// Sample pages to run the schema against, at most 5
    pub urls: Vec<String>,
    /// Version to test; latest when omitted
    pub version: Option<u32>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct UrlCheckResponse {
    pub url: String,
    pub success: bool,
    pub records_found: usize,
    pub records_rejected: u32,
    pub fields_extracted: Vec<String>,
    pub errors: Vec<String>,
}

impl From<UrlCheck> for UrlCheckResponse {
    fn from(check: UrlCheck) -> Self {
        Self {
            url: check.url,
            success: check.success,
            records_found: check.records_found,
            records_rejected: check.records_rejected,
            fields_extracted: check.fields_extracted,
            errors: check.errors,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ValidateSchemaResponse {
    pub schema_id: String,
    pub version: u32,
    pub results: Vec<UrlCheckResponse>,
    pub overall_success: bool,
}

impl From<DryRunReport> for ValidateSchemaResponse {
    fn from(report: DryRunReport) -> Self {
        Self {
            schema_id: report.schema_id,
            version: report.version,
            results: report.results.into_iter().map(Into::into).collect(),
            overall_success: report.overall_success,
        }
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateTaskRequest {
    pub source_id: String,
    pub schema_id: String,
    /// Pin a schema version; latest when omitted
    pub schema_version: Option<u32>,
    pub target_url: String,
    /// "http" (default) or "browser"
    pub mode: Option<String>,
    /// 1 (highest) to 5; defaults to 3
    pub priority: Option<u8>,
    /// Defaults to 3
    pub max_attempts: Option<u32>,
    /// Receives a POST when the task reaches a terminal status
    pub callback_url: Option<String>,
    /// Do not start before this time
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl TryFrom<CreateTaskRequest> for NewTaskRequest {
    type Error = AppError;

    fn try_from(body: CreateTaskRequest) -> Result<Self, AppError> {
        let mut request = NewTaskRequest::new(body.source_id, body.schema_id, body.target_url);
        if let Some(mode) = parse_field(body.mode)? {
            request = request.with_mode(mode);
        }
        if let Some(priority) = body.priority {
            request = request.with_priority(priority);
        }
        if let Some(max) = body.max_attempts {
            request = request.with_max_attempts(max);
        }
        if let Some(version) = body.schema_version {
            request = request.with_schema_version(version);
        }
        if let Some(url) = body.callback_url {
            request = request.with_callback_url(url);
        }
        request.scheduled_for = body.scheduled_for;
        Ok(request)
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CreateTaskResponse {
    pub task_id: Uuid,
    pub status: String,
    pub schema_version: u32,
    pub mode: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct TaskResponse {
    pub id: Uuid,
    pub source_id: String,
    pub schema_id: String,
    pub schema_version: u32,
    pub target_url: String,
    pub mode: String,
    pub priority: u8,
    pub status: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub records_extracted: u64,
    pub records_rejected: u64,
    pub pages_processed: u32,
    pub cancel_requested: bool,
    pub worker_id: Option<String>,
    pub callback_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub scheduled_for: DateTime<Utc>,
    #[schema(value_type = Vec<Object>)]
    pub errors: Vec<TaskError>,
    #[schema(value_type = Vec<Object>)]
    pub history: Vec<StatusChange>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            source_id: task.source_id,
            schema_id: task.schema_id,
            schema_version: task.schema_version,
            target_url: task.target_url,
            mode: task.mode.to_string(),
            priority: task.priority,
            status: task.status.to_string(),
            attempt: task.attempt,
            max_attempts: task.max_attempts,
            records_extracted: task.records_extracted,
            records_rejected: task.records_rejected,
            pages_processed: task.pages_processed,
            cancel_requested: task.cancel_requested,
            worker_id: task.worker_id,
            callback_url: task.callback_url,
            created_at: task.created_at,
            updated_at: task.updated_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            scheduled_for: task.scheduled_for,
            errors: task.errors,
            history: task.history,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    pub source_id: Option<String>,
    pub schema_id: Option<String>,
    pub mode: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl TryFrom<ListTasksQuery> for TaskFilter {
    type Error = AppError;

    fn try_from(query: ListTasksQuery) -> Result<Self, AppError> {
        let defaults = TaskFilter::default();
        Ok(TaskFilter {
            status: parse_field(query.status)?,
            source_id: query.source_id,
            schema_id: query.schema_id,
            mode: parse_field(query.mode)?,
            limit: query.limit.unwrap_or(defaults.limit).min(MAX_PAGE_SIZE),
            offset: query.offset.unwrap_or(0),
        })
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskResponse>,
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct RecordsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl RecordsQuery {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(100).min(MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct RecordResponse {
    pub record_hash: String,
    pub page: u32,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<ExtractedRecord> for RecordResponse {
    fn from(record: ExtractedRecord) -> Self {
        Self {
            record_hash: record.record_hash,
            page: record.page,
            data: record.data,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct RecordListResponse {
    pub task_id: Uuid,
    pub records: Vec<RecordResponse>,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct QueueStatsResponse {
    pub mode: String,
    /// Ready plus delayed
    pub depth: u64,
    pub ready: u64,
    pub delayed: u64,
    pub running: u64,
    pub consumers: u64,
}

impl From<ModeMetrics> for QueueStatsResponse {
    fn from(m: ModeMetrics) -> Self {
        Self {
            mode: m.mode.to_string(),
            depth: m.ready + m.delayed,
            ready: m.ready,
            delayed: m.delayed,
            running: m.running,
            consumers: m.consumers,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct StatsResponse {
    pub queues: Vec<QueueStatsResponse>,
    pub tasks_by_status: BTreeMap<String, u64>,
    pub total_tasks: u64,
    pub success_rate: Option<f64>,
    pub avg_duration_ms: Option<f64>,
    pub generated_at: DateTime<Utc>,
}

impl From<StatsSnapshot> for StatsResponse {
    fn from(s: StatsSnapshot) -> Self {
        Self {
            queues: s.queues.into_iter().map(Into::into).collect(),
            tasks_by_status: s
                .tasks_by_status
                .into_iter()
                .map(|(status, n)| (status.to_string(), n))
                .collect(),
            total_tasks: s.total_tasks,
            success_rate: s.success_rate,
            avg_duration_ms: s.avg_duration_ms,
            generated_at: s.generated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
