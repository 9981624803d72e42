use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Carve API",
        version = "0.1.0",
        description = "Schema-driven web extraction with a prioritized task queue."
    ),
    paths(
        crate::routes::create_schema,
        crate::routes::list_schemas,
        crate::routes::get_schema,
        crate::routes::publish_schema,
        crate::routes::deactivate_schema,
        crate::routes::list_schema_versions,
        crate::routes::activate_schema,
        crate::routes::validate_schema,
        crate::routes::create_task,
        crate::routes::list_tasks,
        crate::routes::get_task,
        crate::routes::list_records,
        crate::routes::retry_task,
        crate::routes::cancel_task,
        crate::routes::stats,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::CreateSchemaRequest,
        crate::dto::PublishSchemaRequest,
        crate::dto::SchemaResponse,
        crate::dto::SchemaListResponse,
        crate::dto::ValidateSchemaRequest,
        crate::dto::UrlCheckResponse,
        crate::dto::ValidateSchemaResponse,
        crate::dto::CreateTaskRequest,
        crate::dto::CreateTaskResponse,
        crate::dto::TaskResponse,
        crate::dto::TaskListResponse,
        crate::dto::RecordResponse,
        crate::dto::RecordListResponse,
        crate::dto::QueueStatsResponse,
        crate::dto::StatsResponse,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "schemas", description = "Versioned parsing schemas"),
        (name = "tasks", description = "Extraction tasks and their records"),
        (name = "system", description = "Queue stats and health"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds the Bearer token security scheme to the OpenAPI document.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some(
                            "API key. Set via CARVE_SERVER_API_KEY environment variable.",
                        ))
                        .build(),
                ),
            );
        }
    }
}
