use carve_core::AppError;
use carve_core::task::RetryPolicy;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;
use crate::record_repository::PgRecordRepository;
use crate::schema_repository::PgSchemaRepository;
use crate::task_repository::PgTaskRepository;

/// Central database facade: owns the connection pool, runs migrations,
/// and vends repository instances.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;
        tracing::debug!(max_connections = config.max_connections, "Database pool ready");

        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    pub fn task_repo(&self) -> PgTaskRepository {
        PgTaskRepository::new(self.pool.clone())
    }

    pub fn task_repo_with_policy(&self, policy: RetryPolicy) -> PgTaskRepository {
        PgTaskRepository::new(self.pool.clone()).with_retry_policy(policy)
    }

    pub fn schema_repo(&self) -> PgSchemaRepository {
        PgSchemaRepository::new(self.pool.clone())
    }

    pub fn record_repo(&self) -> PgRecordRepository {
        PgRecordRepository::new(self.pool.clone())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
