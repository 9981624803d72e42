use carve_core::schema::{FieldDefinition, NewSchema, SchemaDefinition};
use carve_core::task::NewTask;
use carve_core::Mode;
use carve_db::Database;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// Spins up a PostgreSQL container and returns a migrated database.
///
/// The `ContainerAsync` must be kept in scope for the test duration;
/// dropping it stops the container.
pub async fn setup_test_db() -> (Database, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "carve_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/carve_test");

    // Retry connection until container is fully ready
    const MAX_RETRIES: u32 = 30;
    let mut retries = 0;
    let pool = loop {
        match PgPoolOptions::new()
            .max_connections(10)
            .connect(&connection_string)
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retries += 1;
                if retries >= MAX_RETRIES {
                    panic!("Failed to connect to database after {MAX_RETRIES} retries: {e}");
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    };

    let db = Database::from_pool(pool);
    db.migrate().await.expect("Failed to run migrations");
    (db, container)
}

pub fn listing_schema(schema_id: &str, source_id: &str) -> NewSchema {
    let mut definition = SchemaDefinition::new(vec![FieldDefinition::new("title", "h2")]);
    definition.container_selector = Some("div.item".into());
    NewSchema::new(schema_id, source_id, definition)
}

pub fn new_task(priority: u8, mode: Mode) -> NewTask {
    NewTask {
        source_id: "shop".into(),
        schema_id: "listing".into(),
        schema_version: 1,
        target_url: "https://shop.test/list".into(),
        mode,
        priority,
        max_attempts: 3,
        callback_url: None,
        scheduled_for: None,
    }
}
