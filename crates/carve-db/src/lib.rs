pub mod config;
pub mod database;
pub mod record_repository;
pub mod schema_repository;
pub mod task_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use record_repository::PgRecordRepository;
pub use schema_repository::PgSchemaRepository;
pub use task_repository::PgTaskRepository;

use carve_core::AppError;

pub(crate) fn db_err(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}
