use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use carve_core::error::AppError;
use carve_core::models::{ExtractedRecord, NewRecord};
use carve_core::traits::RecordStore;

use crate::db_err;

/// Extracted records in PostgreSQL, unique per `(task_id, record_hash)`.
#[derive(Clone)]
pub struct PgRecordRepository {
    pool: Pool<Postgres>,
}

impl PgRecordRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn count(&self, task_id: Uuid) -> Result<u64, AppError> {
        let (count,): (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM extracted_records WHERE task_id = $1"#)
            .bind(task_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(count as u64)
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    task_id: Uuid,
    record_hash: String,
    page: i32,
    data: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<RecordRow> for ExtractedRecord {
    fn from(row: RecordRow) -> Self {
        ExtractedRecord {
            task_id: row.task_id,
            record_hash: row.record_hash,
            page: row.page as u32,
            data: row.data,
            created_at: row.created_at,
        }
    }
}

impl RecordStore for PgRecordRepository {
    async fn save_page(&self, task_id: Uuid, records: &[NewRecord]) -> Result<u64, AppError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut saved = 0;
        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO extracted_records (task_id, record_hash, page, data)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (task_id, record_hash) DO NOTHING
                "#,
            )
            .bind(task_id)
            .bind(&record.record_hash)
            .bind(record.page as i32)
            .bind(&record.data)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            saved += result.rows_affected();
        }
        tx.commit().await.map_err(db_err)?;
        Ok(saved)
    }

    async fn list_records(&self, task_id: Uuid, limit: usize, offset: usize) -> Result<Vec<ExtractedRecord>, AppError> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT task_id, record_hash, page, data, created_at
            FROM extracted_records
            WHERE task_id = $1
            ORDER BY page, created_at, record_hash
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(task_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
