use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Pool, Postgres};

use carve_core::error::AppError;
use carve_core::schema::{NewSchema, ParsingSchema, SchemaDefinition, SchemaFilter};
use carve_core::traits::SchemaStore;

use crate::db_err;

/// Versioned schema registry in PostgreSQL.
///
/// `schemas` holds identity and the active flag; every published
/// definition is an immutable row in `schema_versions`.
#[derive(Clone)]
pub struct PgSchemaRepository {
    pool: Pool<Postgres>,
}

impl PgSchemaRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SchemaRow {
    schema_id: String,
    source_id: String,
    is_active: bool,
    version: i32,
    definition: Json<SchemaDefinition>,
    created_at: DateTime<Utc>,
}

impl From<SchemaRow> for ParsingSchema {
    fn from(row: SchemaRow) -> Self {
        ParsingSchema {
            schema_id: row.schema_id,
            source_id: row.source_id,
            version: row.version as u32,
            is_active: row.is_active,
            created_at: row.created_at,
            definition: row.definition.0,
        }
    }
}

/// Make `schema_id` the only active schema of `source_id`.
async fn activate(conn: &mut PgConnection, schema_id: &str, source_id: &str) -> Result<(), AppError> {
    let superseded = sqlx::query(
        r#"
        UPDATE schemas SET is_active = FALSE, updated_at = NOW()
        WHERE source_id = $1 AND schema_id <> $2 AND is_active
        "#,
    )
    .bind(source_id)
    .bind(schema_id)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    if superseded.rows_affected() > 0 {
        tracing::info!(%schema_id, %source_id, count = superseded.rows_affected(), "Deactivated superseded schemas");
    }

    sqlx::query(r#"UPDATE schemas SET is_active = TRUE, updated_at = NOW() WHERE schema_id = $1"#)
        .bind(schema_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn insert_version(
    conn: &mut PgConnection,
    schema_id: &str,
    version: u32,
    definition: &SchemaDefinition,
) -> Result<DateTime<Utc>, AppError> {
    let (created_at,): (DateTime<Utc>,) = sqlx::query_as(
        r#"
        INSERT INTO schema_versions (schema_id, version, definition)
        VALUES ($1, $2, $3)
        RETURNING created_at
        "#,
    )
    .bind(schema_id)
    .bind(version as i32)
    .bind(Json(definition))
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(created_at)
}

impl SchemaStore for PgSchemaRepository {
    async fn create_schema(&self, schema: NewSchema) -> Result<ParsingSchema, AppError> {
        schema.validate()?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO schemas (schema_id, source_id)
            VALUES ($1, $2)
            ON CONFLICT (schema_id) DO NOTHING
            "#,
        )
        .bind(&schema.schema_id)
        .bind(&schema.source_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if inserted.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "schema '{}' already exists; publish a new version instead",
                schema.schema_id
            )));
        }

        let created_at = insert_version(&mut tx, &schema.schema_id, 1, &schema.definition).await?;
        activate(&mut tx, &schema.schema_id, &schema.source_id).await?;
        tx.commit().await.map_err(db_err)?;

        Ok(ParsingSchema {
            schema_id: schema.schema_id,
            source_id: schema.source_id,
            version: 1,
            is_active: true,
            created_at,
            definition: schema.definition,
        })
    }

    async fn publish_version(
        &self,
        schema_id: &str,
        definition: SchemaDefinition,
    ) -> Result<ParsingSchema, AppError> {
        definition.validate()?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Row lock serializes concurrent publishes of one schema.
        let (source_id,): (String,) =
            sqlx::query_as(r#"SELECT source_id FROM schemas WHERE schema_id = $1 FOR UPDATE"#)
                .bind(schema_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .ok_or_else(|| AppError::NotFound(format!("schema {schema_id}")))?;
        let (latest,): (i32,) =
            sqlx::query_as(r#"SELECT COALESCE(MAX(version), 0) FROM schema_versions WHERE schema_id = $1"#)
                .bind(schema_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;

        let version = latest as u32 + 1;
        let created_at = insert_version(&mut tx, schema_id, version, &definition).await?;
        activate(&mut tx, schema_id, &source_id).await?;
        tx.commit().await.map_err(db_err)?;

        Ok(ParsingSchema {
            schema_id: schema_id.to_string(),
            source_id,
            version,
            is_active: true,
            created_at,
            definition,
        })
    }

    async fn get_schema(&self, schema_id: &str, version: Option<u32>) -> Result<Option<ParsingSchema>, AppError> {
        let row = sqlx::query_as::<_, SchemaRow>(
            r#"
            SELECT s.schema_id, s.source_id, s.is_active, v.version, v.definition, v.created_at
            FROM schemas s
            JOIN schema_versions v ON v.schema_id = s.schema_id
            WHERE s.schema_id = $1 AND ($2::INTEGER IS NULL OR v.version = $2)
            ORDER BY v.version DESC
            LIMIT 1
            "#,
        )
        .bind(schema_id)
        .bind(version.map(|v| v as i32))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(Into::into))
    }

    async fn list_schemas(&self, filter: &SchemaFilter) -> Result<Vec<ParsingSchema>, AppError> {
        let rows = sqlx::query_as::<_, SchemaRow>(
            r#"
            SELECT DISTINCT ON (s.schema_id)
                s.schema_id, s.source_id, s.is_active, v.version, v.definition, v.created_at
            FROM schemas s
            JOIN schema_versions v ON v.schema_id = s.schema_id
            WHERE ($1::VARCHAR IS NULL OR s.source_id = $1)
              AND (NOT $2 OR s.is_active)
            ORDER BY s.schema_id, v.version DESC
            "#,
        )
        .bind(filter.source_id.as_deref())
        .bind(filter.active_only)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn deactivate_schema(&self, schema_id: &str) -> Result<(), AppError> {
        let result = sqlx::query(r#"UPDATE schemas SET is_active = FALSE, updated_at = NOW() WHERE schema_id = $1"#)
            .bind(schema_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("schema {schema_id}")));
        }
        Ok(())
    }

    async fn list_versions(&self, schema_id: &str) -> Result<Vec<ParsingSchema>, AppError> {
        let rows = sqlx::query_as::<_, SchemaRow>(
            r#"
            SELECT s.schema_id, s.source_id, s.is_active, v.version, v.definition, v.created_at
            FROM schemas s
            JOIN schema_versions v ON v.schema_id = s.schema_id
            WHERE s.schema_id = $1
            ORDER BY v.version ASC
            "#,
        )
        .bind(schema_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn activate_schema(&self, schema_id: &str) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let (source_id,): (String,) =
            sqlx::query_as(r#"SELECT source_id FROM schemas WHERE schema_id = $1 FOR UPDATE"#)
                .bind(schema_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .ok_or_else(|| AppError::NotFound(format!("schema {schema_id}")))?;
        activate(&mut tx, schema_id, &source_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}
