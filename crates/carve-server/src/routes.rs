use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tower_http::limit::RequestBodyLimitLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use carve_core::task::TaskFilter;
use carve_core::task_queue::TaskQueue;
use carve_core::traits::{RecordStore, SchemaStore};

use crate::auth::require_api_key;
use crate::dto::{
    CreateSchemaRequest, CreateTaskRequest, CreateTaskResponse, GetSchemaQuery, HealthResponse,
    ListSchemasQuery, ListTasksQuery, PublishSchemaRequest, RecordListResponse, RecordsQuery,
    SchemaListResponse, SchemaResponse, StatsResponse, TaskListResponse, TaskResponse,
    ValidateSchemaRequest, ValidateSchemaResponse,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

type Shared<Q, S, R> = State<Arc<AppState<Q, S, R>>>;

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the full router with all routes and middleware.
pub fn router<Q, S, R>(state: Arc<AppState<Q, S, R>>) -> Router
where
    Q: TaskQueue,
    S: SchemaStore,
    R: RecordStore,
{
    let api_key: Arc<str> = Arc::from(state.api_key.as_str());
    let api = Router::new()
        .route(
            "/v1/schemas",
            post(create_schema::<Q, S, R>).get(list_schemas::<Q, S, R>),
        )
        .route(
            "/v1/schemas/{schema_id}",
            get(get_schema::<Q, S, R>)
                .put(publish_schema::<Q, S, R>)
                .delete(deactivate_schema::<Q, S, R>),
        )
        .route(
            "/v1/schemas/{schema_id}/versions",
            get(list_schema_versions::<Q, S, R>),
        )
        .route(
            "/v1/schemas/{schema_id}/activate",
            post(activate_schema::<Q, S, R>),
        )
        .route(
            "/v1/schemas/{schema_id}/validate",
            post(validate_schema::<Q, S, R>),
        )
        .route(
            "/v1/tasks",
            post(create_task::<Q, S, R>).get(list_tasks::<Q, S, R>),
        )
        .route("/v1/tasks/{id}", get(get_task::<Q, S, R>))
        .route("/v1/tasks/{id}/records", get(list_records::<Q, S, R>))
        .route("/v1/tasks/{id}/retry", post(retry_task::<Q, S, R>))
        .route("/v1/tasks/{id}/cancel", post(cancel_task::<Q, S, R>))
        .route("/v1/stats", get(stats::<Q, S, R>))
        .layer(middleware::from_fn_with_state(api_key, require_api_key));

    let public = Router::new()
        .route("/health", get(health::<Q, S, R>))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public
        .merge(api)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Schemas
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/schemas",
    request_body = CreateSchemaRequest,
    responses(
        (status = 201, description = "Schema registered as version 1", body = SchemaResponse),
        (status = 400, description = "Invalid schema", body = crate::dto::ErrorResponse),
        (status = 409, description = "Schema already exists", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "schemas"
)]
pub async fn create_schema<Q: TaskQueue, S: SchemaStore, R: RecordStore>(
    State(state): Shared<Q, S, R>,
    axum::Json(body): axum::Json<CreateSchemaRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let schema = state.schemas.create(body.into()).await?;
    Ok((StatusCode::CREATED, axum::Json(SchemaResponse::from(schema))))
}

#[utoipa::path(
    get,
    path = "/v1/schemas",
    params(ListSchemasQuery),
    responses(
        (status = 200, description = "Latest version of each schema", body = SchemaListResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "schemas"
)]
pub async fn list_schemas<Q: TaskQueue, S: SchemaStore, R: RecordStore>(
    State(state): Shared<Q, S, R>,
    Query(query): Query<ListSchemasQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let schemas = state.schemas.list(&query.into()).await?;
    let response = SchemaListResponse {
        total: schemas.len(),
        schemas: schemas.into_iter().map(SchemaResponse::from).collect(),
    };
    Ok(axum::Json(response))
}

#[utoipa::path(
    get,
    path = "/v1/schemas/{schema_id}",
    params(
        ("schema_id" = String, Path, description = "Schema ID"),
        GetSchemaQuery,
    ),
    responses(
        (status = 200, description = "Schema version", body = SchemaResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "schemas"
)]
pub async fn get_schema<Q: TaskQueue, S: SchemaStore, R: RecordStore>(
    State(state): Shared<Q, S, R>,
    Path(schema_id): Path<String>,
    Query(query): Query<GetSchemaQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let schema = state.schemas.get(&schema_id, query.version).await?;
    Ok(axum::Json(SchemaResponse::from(schema)))
}

#[utoipa::path(
    put,
    path = "/v1/schemas/{schema_id}",
    params(("schema_id" = String, Path, description = "Schema ID")),
    request_body = PublishSchemaRequest,
    responses(
        (status = 200, description = "New version published", body = SchemaResponse),
        (status = 400, description = "Invalid schema", body = crate::dto::ErrorResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "schemas"
)]
pub async fn publish_schema<Q: TaskQueue, S: SchemaStore, R: RecordStore>(
    State(state): Shared<Q, S, R>,
    Path(schema_id): Path<String>,
    axum::Json(body): axum::Json<PublishSchemaRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let schema = state.schemas.publish(&schema_id, body.definition).await?;
    Ok(axum::Json(SchemaResponse::from(schema)))
}

#[utoipa::path(
    delete,
    path = "/v1/schemas/{schema_id}",
    params(("schema_id" = String, Path, description = "Schema ID")),
    responses(
        (status = 204, description = "Schema deactivated"),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "schemas"
)]
pub async fn deactivate_schema<Q: TaskQueue, S: SchemaStore, R: RecordStore>(
    State(state): Shared<Q, S, R>,
    Path(schema_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.schemas.deactivate(&schema_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/v1/schemas/{schema_id}/versions",
    params(("schema_id" = String, Path, description = "Schema ID")),
    responses(
        (status = 200, description = "Every version, oldest first", body = SchemaListResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "schemas"
)]
pub async fn list_schema_versions<Q: TaskQueue, S: SchemaStore, R: RecordStore>(
    State(state): Shared<Q, S, R>,
    Path(schema_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let versions = state.schemas.versions(&schema_id).await?;
    let response = SchemaListResponse {
        total: versions.len(),
        schemas: versions.into_iter().map(SchemaResponse::from).collect(),
    };
    Ok(axum::Json(response))
}

#[utoipa::path(
    post,
    path = "/v1/schemas/{schema_id}/activate",
    params(("schema_id" = String, Path, description = "Schema ID")),
    responses(
        (status = 200, description = "Schema active again, latest version", body = SchemaResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "schemas"
)]
pub async fn activate_schema<Q: TaskQueue, S: SchemaStore, R: RecordStore>(
    State(state): Shared<Q, S, R>,
    Path(schema_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let schema = state.schemas.activate(&schema_id).await?;
    Ok(axum::Json(SchemaResponse::from(schema)))
}

#[utoipa::path(
    post,
    path = "/v1/schemas/{schema_id}/validate",
    params(("schema_id" = String, Path, description = "Schema ID")),
    request_body = ValidateSchemaRequest,
    responses(
        (status = 200, description = "Per-URL extraction results, nothing stored", body = ValidateSchemaResponse),
        (status = 400, description = "No URLs or more than 5", body = crate::dto::ErrorResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "schemas"
)]
pub async fn validate_schema<Q: TaskQueue, S: SchemaStore, R: RecordStore>(
    State(state): Shared<Q, S, R>,
    Path(schema_id): Path<String>,
    axum::Json(body): axum::Json<ValidateSchemaRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state
        .schemas
        .dry_run(&state.fetcher, &schema_id, body.version, &body.urls)
        .await?;
    Ok(axum::Json(ValidateSchemaResponse::from(report)))
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/tasks",
    request_body = CreateTaskRequest,
    responses(
        (status = 202, description = "Task queued", body = CreateTaskResponse),
        (status = 400, description = "Invalid request", body = crate::dto::ErrorResponse),
        (status = 404, description = "Schema not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "tasks"
)]
pub async fn create_task<Q: TaskQueue, S: SchemaStore, R: RecordStore>(
    State(state): Shared<Q, S, R>,
    axum::Json(body): axum::Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.tasks.create_task(body.try_into()?).await?;
    let response = CreateTaskResponse {
        task_id: task.id,
        status: task.status.to_string(),
        schema_version: task.schema_version,
        mode: task.mode.to_string(),
    };
    Ok((StatusCode::ACCEPTED, axum::Json(response)))
}

#[utoipa::path(
    get,
    path = "/v1/tasks",
    params(ListTasksQuery),
    responses(
        (status = 200, description = "Tasks, newest first", body = TaskListResponse),
        (status = 400, description = "Invalid filter", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "tasks"
)]
pub async fn list_tasks<Q: TaskQueue, S: SchemaStore, R: RecordStore>(
    State(state): Shared<Q, S, R>,
    Query(query): Query<ListTasksQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = TaskFilter::try_from(query)?;
    let page = state.tasks.list_tasks(&filter).await?;
    let response = TaskListResponse {
        tasks: page.tasks.into_iter().map(TaskResponse::from).collect(),
        total: page.total,
        limit: filter.limit,
        offset: filter.offset,
    };
    Ok(axum::Json(response))
}

#[utoipa::path(
    get,
    path = "/v1/tasks/{id}",
    params(("id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Task with errors and status history", body = TaskResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "tasks"
)]
pub async fn get_task<Q: TaskQueue, S: SchemaStore, R: RecordStore>(
    State(state): Shared<Q, S, R>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.tasks.get_task(id).await?;
    Ok(axum::Json(TaskResponse::from(task)))
}

#[utoipa::path(
    get,
    path = "/v1/tasks/{id}/records",
    params(
        ("id" = Uuid, Path, description = "Task ID"),
        RecordsQuery,
    ),
    responses(
        (status = 200, description = "Extracted records", body = RecordListResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "tasks"
)]
pub async fn list_records<Q: TaskQueue, S: SchemaStore, R: RecordStore>(
    State(state): Shared<Q, S, R>,
    Path(id): Path<Uuid>,
    Query(query): Query<RecordsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let records = state.tasks.records(id, query.limit(), query.offset()).await?;
    let response = RecordListResponse {
        task_id: id,
        records: records.into_iter().map(Into::into).collect(),
    };
    Ok(axum::Json(response))
}

#[utoipa::path(
    post,
    path = "/v1/tasks/{id}/retry",
    params(("id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Task requeued", body = TaskResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 409, description = "Task is not failed or dead-lettered", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "tasks"
)]
pub async fn retry_task<Q: TaskQueue, S: SchemaStore, R: RecordStore>(
    State(state): Shared<Q, S, R>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.tasks.retry(id).await?;
    Ok(axum::Json(TaskResponse::from(task)))
}

#[utoipa::path(
    post,
    path = "/v1/tasks/{id}/cancel",
    params(("id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Cancelled, or flagged if running", body = TaskResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 409, description = "Task already finished", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "tasks"
)]
pub async fn cancel_task<Q: TaskQueue, S: SchemaStore, R: RecordStore>(
    State(state): Shared<Q, S, R>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.tasks.cancel(id).await?;
    Ok(axum::Json(TaskResponse::from(task)))
}

// ---------------------------------------------------------------------------
// Stats & health
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/stats",
    responses(
        (status = 200, description = "Queue depth and task outcomes", body = StatsResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "system"
)]
pub async fn stats<Q: TaskQueue, S: SchemaStore, R: RecordStore>(
    State(state): Shared<Q, S, R>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.stats.snapshot().await?;
    Ok(axum::Json(StatsResponse::from(snapshot)))
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health<Q: TaskQueue, S: SchemaStore, R: RecordStore>(
    State(state): Shared<Q, S, R>,
) -> impl IntoResponse {
    match state.queue.ping().await {
        Ok(()) => (
            StatusCode::OK,
            axum::Json(HealthResponse {
                status: "healthy",
                database: "ok",
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(HealthResponse {
                    status: "unhealthy",
                    database: "error",
                }),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use carve_client::{ReqwestFetcher, ReqwestNotifier};
    use carve_core::memory::{MemoryRecordStore, MemoryStore};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;

    const KEY: &str = "test-secret-key";

    fn app() -> Router {
        let store = MemoryStore::new();
        router(Arc::new(AppState::new(
            store.clone(),
            store,
            MemoryRecordStore::new(),
            ReqwestNotifier::new().unwrap(),
            ReqwestFetcher::new().unwrap(),
            KEY,
        )))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {KEY}"));
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn schema_body() -> Value {
        json!({
            "schema_id": "listing",
            "source_id": "shop",
            "definition": {
                "container_selector": "div.item",
                "fields": [{ "name": "title", "selector": "h2" }],
                "url_patterns": ["^https://shop\\.test/"]
            }
        })
    }

    #[tokio::test]
    async fn health_is_public() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn api_requires_bearer_key() {
        let app = app();
        let missing = app
            .clone()
            .oneshot(Request::get("/v1/tasks").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = app
            .oneshot(
                Request::get("/v1/tasks")
                    .header("authorization", "Bearer wrong-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn schema_lifecycle() {
        let app = app();
        let (status, created) = call(&app, "POST", "/v1/schemas", Some(schema_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["version"], 1);

        let (status, _) = call(&app, "POST", "/v1/schemas", Some(schema_body())).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, published) = call(
            &app,
            "PUT",
            "/v1/schemas/listing",
            Some(json!({ "definition": schema_body()["definition"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(published["version"], 2);

        let (status, v1) = call(&app, "GET", "/v1/schemas/listing?version=1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v1["version"], 1);

        let (status, _) = call(&app, "DELETE", "/v1/schemas/listing", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, listed) = call(&app, "GET", "/v1/schemas?active_only=true", None).await;
        assert_eq!(listed["total"], 0);

        let (status, _) = call(&app, "GET", "/v1/schemas/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_schema_is_rejected() {
        let app = app();
        let mut body = schema_body();
        body["definition"]["fields"] = json!([]);
        let (status, json) = call(&app, "POST", "/v1/schemas", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "validation_error");
    }

    #[tokio::test]
    async fn task_lifecycle() {
        let app = app();
        call(&app, "POST", "/v1/schemas", Some(schema_body())).await;

        let (status, created) = call(
            &app,
            "POST",
            "/v1/tasks",
            Some(json!({
                "source_id": "shop",
                "schema_id": "listing",
                "target_url": "https://shop.test/list",
                "priority": 2
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(created["status"], "queued");
        assert_eq!(created["mode"], "http");
        let id = created["task_id"].as_str().unwrap().to_string();

        let (status, task) = call(&app, "GET", &format!("/v1/tasks/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(task["priority"], 2);
        assert_eq!(task["history"][0]["to"], "queued");

        let (status, _) = call(&app, "POST", &format!("/v1/tasks/{id}/retry"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, cancelled) = call(&app, "POST", &format!("/v1/tasks/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["status"], "cancelled");

        let (status, err) = call(&app, "POST", &format!("/v1/tasks/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["error"], "invalid_transition");

        let (_, records) = call(&app, "GET", &format!("/v1/tasks/{id}/records"), None).await;
        assert_eq!(records["records"], json!([]));

        let (_, listed) = call(&app, "GET", "/v1/tasks?status=cancelled", None).await;
        assert_eq!(listed["total"], 1);
    }

    #[tokio::test]
    async fn bad_task_requests() {
        let app = app();
        call(&app, "POST", "/v1/schemas", Some(schema_body())).await;

        let (status, _) = call(
            &app,
            "POST",
            "/v1/tasks",
            Some(json!({
                "source_id": "shop",
                "schema_id": "listing",
                "target_url": "https://elsewhere.test/"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            "POST",
            "/v1/tasks",
            Some(json!({
                "source_id": "shop",
                "schema_id": "missing",
                "target_url": "https://shop.test/"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "GET", "/v1/tasks?status=bogus", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "GET", &format!("/v1/tasks/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stats_reports_every_mode() {
        let app = app();
        call(&app, "POST", "/v1/schemas", Some(schema_body())).await;
        call(
            &app,
            "POST",
            "/v1/tasks",
            Some(json!({
                "source_id": "shop",
                "schema_id": "listing",
                "target_url": "https://shop.test/list"
            })),
        )
        .await;

        let (status, stats) = call(&app, "GET", "/v1/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["queues"].as_array().unwrap().len(), 2);
        assert_eq!(stats["queues"][0]["depth"], 1);
        assert_eq!(stats["tasks_by_status"]["queued"], 1);
        assert_eq!(stats["total_tasks"], 1);
    }

    #[tokio::test]
    async fn schema_versions_and_reactivation() {
        let app = app();
        call(&app, "POST", "/v1/schemas", Some(schema_body())).await;
        call(
            &app,
            "PUT",
            "/v1/schemas/listing",
            Some(json!({ "definition": schema_body()["definition"] })),
        )
        .await;

        let (status, versions) = call(&app, "GET", "/v1/schemas/listing/versions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(versions["total"], 2);
        assert_eq!(versions["schemas"][0]["version"], 1);
        assert_eq!(versions["schemas"][1]["version"], 2);

        call(&app, "DELETE", "/v1/schemas/listing", None).await;
        let (status, active) = call(&app, "POST", "/v1/schemas/listing/activate", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(active["is_active"], true);
        assert_eq!(active["version"], 2);

        let (status, _) = call(&app, "GET", "/v1/schemas/nope/versions", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "POST", "/v1/schemas/nope/activate", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn validate_rejects_bad_url_lists_and_private_targets() {
        let app = app();
        call(&app, "POST", "/v1/schemas", Some(schema_body())).await;

        let (status, err) = call(
            &app,
            "POST",
            "/v1/schemas/listing/validate",
            Some(json!({ "urls": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["error"], "validation_error");

        let six: Vec<String> = (0..6).map(|i| format!("https://shop.test/{i}")).collect();
        let (status, _) = call(
            &app,
            "POST",
            "/v1/schemas/listing/validate",
            Some(json!({ "urls": six })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            "POST",
            "/v1/schemas/nope/validate",
            Some(json!({ "urls": ["https://shop.test/"] })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, report) = call(
            &app,
            "POST",
            "/v1/schemas/listing/validate",
            Some(json!({ "urls": ["http://127.0.0.1/admin"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["overall_success"], false);
        assert!(
            report["results"][0]["errors"][0]
                .as_str()
                .unwrap()
                .contains("SSRF")
        );
    }
}
