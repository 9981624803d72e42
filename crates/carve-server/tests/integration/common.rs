use std::sync::Arc;

use axum::Router;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

use carve_client::{ReqwestFetcher, ReqwestNotifier};
use carve_db::Database;
use carve_server::routes;
use carve_server::state::AppState;

pub const TEST_API_KEY: &str = "test-secret-key";

/// Spin up a PostgreSQL container and return the test app router + container handle.
pub async fn setup_test_app() -> (Router, ContainerAsync<GenericImage>) {
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

    let url = format!("postgresql://postgres:postgres@{host}:{port}/carve_test");
    let db = Database::from_pool(retry_connect(&url).await);
    db.migrate().await.expect("Failed to run migrations");

    let state = Arc::new(AppState::new(
        db.task_repo(),
        db.schema_repo(),
        db.record_repo(),
        ReqwestNotifier::new().expect("Failed to build notifier"),
        ReqwestFetcher::new().expect("Failed to build fetcher"),
        TEST_API_KEY,
    ));

    (routes::router(state), container)
}

async fn retry_connect(url: &str) -> PgPool {
    for _ in 0..30 {
        if let Ok(pool) = PgPoolOptions::new().max_connections(5).connect(url).await {
            return pool;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("Failed to connect to test database");
}
