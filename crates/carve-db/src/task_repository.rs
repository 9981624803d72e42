use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Pool, Postgres};
use uuid::Uuid;

use carve_core::error::AppError;
use carve_core::models::{Mode, TaskError};
use carve_core::state::{TaskEvent, apply};
use carve_core::stats::{ModeMetrics, QueueMetrics};
use carve_core::task::{AttemptReport, NewTask, RetryPolicy, StatusChange, Task, TaskFilter, TaskPage, TaskStatus};
use carve_core::task_queue::{TaskQueue, WORKER_TTL};

use crate::db_err;

/// PostgreSQL-backed task queue using `SELECT FOR UPDATE SKIP LOCKED`.
///
/// Every status change locks the row, runs the shared state machine on the
/// loaded task and writes the result back in the same transaction.
#[derive(Clone)]
pub struct PgTaskRepository {
    pool: Pool<Postgres>,
    retry_policy: RetryPolicy,
    worker_ttl: Duration,
}

impl PgTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry_policy: RetryPolicy::default(),
            worker_ttl: WORKER_TTL,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_worker_ttl(mut self, ttl: Duration) -> Self {
        self.worker_ttl = ttl;
        self
    }

    async fn touch_worker(&self, worker_id: &str) -> Result<(), AppError> {
        sqlx::query(r#"UPDATE workers SET last_seen_at = NOW() WHERE worker_id = $1"#)
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Lock one task, check it with `guard`, apply `event` and persist.
    async fn transition(
        &self,
        task_id: Uuid,
        guard: impl FnOnce(&Task) -> Result<(), AppError> + Send,
        event: TaskEvent,
    ) -> Result<Task, AppError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut task = lock_task(&mut tx, task_id).await?;
        guard(&task)?;
        apply(&mut task, event, &self.retry_policy, Utc::now())?;
        save_task(&mut tx, &task).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(task)
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    source_id: String,
    schema_id: String,
    schema_version: i32,
    target_url: String,
    mode: String,
    priority: i16,
    status: String,
    attempt: i32,
    max_attempts: i32,
    records_extracted: i64,
    records_rejected: i64,
    pages_processed: i32,
    errors: Json<Vec<TaskError>>,
    history: Json<Vec<StatusChange>>,
    cancel_requested: bool,
    worker_id: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    callback_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    scheduled_for: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = AppError;

    fn try_from(row: TaskRow) -> Result<Self, AppError> {
        Ok(Task {
            id: row.id,
            source_id: row.source_id,
            schema_id: row.schema_id,
            schema_version: row.schema_version as u32,
            target_url: row.target_url,
            mode: row.mode.parse().map_err(AppError::DatabaseError)?,
            priority: row.priority as u8,
            status: row.status.parse().map_err(AppError::DatabaseError)?,
            attempt: row.attempt as u32,
            max_attempts: row.max_attempts as u32,
            records_extracted: row.records_extracted as u64,
            records_rejected: row.records_rejected as u64,
            pages_processed: row.pages_processed as u32,
            errors: row.errors.0,
            history: row.history.0,
            cancel_requested: row.cancel_requested,
            worker_id: row.worker_id,
            lease_expires_at: row.lease_expires_at,
            callback_url: row.callback_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            scheduled_for: row.scheduled_for,
        })
    }
}

fn into_tasks(rows: Vec<TaskRow>) -> Result<Vec<Task>, AppError> {
    rows.into_iter().map(Task::try_from).collect()
}

fn lease_until(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + TimeDelta::from_std(lease).unwrap_or_else(|_| TimeDelta::days(1))
}

async fn lock_task(conn: &mut PgConnection, task_id: Uuid) -> Result<Task, AppError> {
    sqlx::query_as::<_, TaskRow>(r#"SELECT * FROM tasks WHERE id = $1 FOR UPDATE"#)
        .bind(task_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?
        .try_into()
}

/// Write back every field the state machine may touch.
async fn save_task(conn: &mut PgConnection, task: &Task) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET status = $2, attempt = $3,
            records_extracted = $4, records_rejected = $5, pages_processed = $6,
            errors = $7, history = $8, cancel_requested = $9,
            worker_id = $10, lease_expires_at = $11,
            updated_at = $12, started_at = $13, completed_at = $14, scheduled_for = $15
        WHERE id = $1
        "#,
    )
    .bind(task.id)
    .bind(task.status.as_str())
    .bind(task.attempt as i32)
    .bind(task.records_extracted as i64)
    .bind(task.records_rejected as i64)
    .bind(task.pages_processed as i32)
    .bind(Json(&task.errors))
    .bind(Json(&task.history))
    .bind(task.cancel_requested)
    .bind(task.worker_id.as_deref())
    .bind(task.lease_expires_at)
    .bind(task.updated_at)
    .bind(task.started_at)
    .bind(task.completed_at)
    .bind(task.scheduled_for)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

impl TaskQueue for PgTaskRepository {
    async fn enqueue(&self, new: NewTask) -> Result<Task, AppError> {
        let now = Utc::now();
        let mut task = Task::new(new, now);
        apply(&mut task, TaskEvent::Admit, &self.retry_policy, now)?;

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, source_id, schema_id, schema_version, target_url, mode, priority,
                status, attempt, max_attempts, history, callback_url,
                created_at, updated_at, scheduled_for
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(task.id)
        .bind(&task.source_id)
        .bind(&task.schema_id)
        .bind(task.schema_version as i32)
        .bind(&task.target_url)
        .bind(task.mode.as_str())
        .bind(task.priority as i16)
        .bind(task.status.as_str())
        .bind(task.attempt as i32)
        .bind(task.max_attempts as i32)
        .bind(Json(&task.history))
        .bind(task.callback_url.as_deref())
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.scheduled_for)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(task)
    }

    async fn claim_next(&self, mode: Mode, worker_id: &str, lease: Duration) -> Result<Option<Task>, AppError> {
        self.touch_worker(worker_id).await?;
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT * FROM tasks
            WHERE status = 'queued' AND mode = $1 AND scheduled_for <= $2
            ORDER BY priority, scheduled_for, seq
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .bind(mode.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut task = Task::try_from(row)?;
        apply(
            &mut task,
            TaskEvent::Claim {
                worker_id: worker_id.to_string(),
                lease_until: lease_until(now, lease),
            },
            &self.retry_policy,
            now,
        )?;
        save_task(&mut tx, &task).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(Some(task))
    }

    async fn heartbeat(&self, task_id: Uuid, worker_id: &str, lease: Duration) -> Result<bool, AppError> {
        self.touch_worker(worker_id).await?;
        let now = Utc::now();
        let renewed: Option<(bool,)> = sqlx::query_as(
            r#"
            UPDATE tasks
            SET lease_expires_at = $3, updated_at = $4
            WHERE id = $1 AND status = 'running' AND worker_id = $2
            RETURNING cancel_requested
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(lease_until(now, lease))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match renewed {
            Some((cancel_requested,)) => Ok(cancel_requested),
            None => match self.get_task(task_id).await? {
                Some(task) => task.ensure_held_by(worker_id).map(|()| task.cancel_requested),
                None => Err(AppError::NotFound(format!("task {task_id}"))),
            },
        }
    }

    async fn finish(&self, task_id: Uuid, worker_id: &str, report: AttemptReport) -> Result<Task, AppError> {
        self.transition(task_id, |task| task.ensure_held_by(worker_id), TaskEvent::Finish(report))
            .await
    }

    async fn retry(&self, task_id: Uuid) -> Result<Task, AppError> {
        self.transition(task_id, |_| Ok(()), TaskEvent::Retry).await
    }

    async fn cancel(&self, task_id: Uuid) -> Result<Task, AppError> {
        self.transition(task_id, |_| Ok(()), TaskEvent::Cancel).await
    }

    async fn reclaim_expired(&self) -> Result<Vec<Task>, AppError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT * FROM tasks
            WHERE status = 'running' AND lease_expires_at < $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut reclaimed = into_tasks(rows)?;
        for task in &mut reclaimed {
            apply(task, TaskEvent::LeaseExpired, &self.retry_policy, now)?;
            save_task(&mut tx, task).await?;
        }
        tx.commit().await.map_err(db_err)?;

        let pruned = sqlx::query(r#"DELETE FROM workers WHERE last_seen_at < NOW() - $1 * INTERVAL '1 second'"#)
            .bind(self.worker_ttl.as_secs_f64())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if pruned.rows_affected() > 0 {
            tracing::info!(count = pruned.rows_affected(), "Pruned stale worker registrations");
        }
        Ok(reclaimed)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, AppError> {
        sqlx::query_as::<_, TaskRow>(r#"SELECT * FROM tasks WHERE id = $1"#)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(Task::try_from)
            .transpose()
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<TaskPage, AppError> {
        let status = filter.status.map(|s| s.as_str());
        let mode = filter.mode.map(|m| m.as_str());
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT * FROM tasks
            WHERE ($1::VARCHAR IS NULL OR status = $1)
              AND ($2::VARCHAR IS NULL OR source_id = $2)
              AND ($3::VARCHAR IS NULL OR schema_id = $3)
              AND ($4::VARCHAR IS NULL OR mode = $4)
            ORDER BY seq DESC
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(status)
        .bind(filter.source_id.as_deref())
        .bind(filter.schema_id.as_deref())
        .bind(mode)
        .bind(filter.limit as i64)
        .bind(filter.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM tasks
            WHERE ($1::VARCHAR IS NULL OR status = $1)
              AND ($2::VARCHAR IS NULL OR source_id = $2)
              AND ($3::VARCHAR IS NULL OR schema_id = $3)
              AND ($4::VARCHAR IS NULL OR mode = $4)
            "#,
        )
        .bind(status)
        .bind(filter.source_id.as_deref())
        .bind(filter.schema_id.as_deref())
        .bind(mode)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(TaskPage {
            tasks: into_tasks(rows)?,
            total: total as u64,
        })
    }

    async fn register_worker(&self, worker_id: &str, mode: Mode) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO workers (worker_id, mode) VALUES ($1, $2)
            ON CONFLICT (worker_id)
            DO UPDATE SET mode = EXCLUDED.mode, registered_at = NOW(), last_seen_at = NOW()
            "#,
        )
        .bind(worker_id)
        .bind(mode.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn deregister_worker(&self, worker_id: &str) -> Result<(), AppError> {
        sqlx::query(r#"DELETE FROM workers WHERE worker_id = $1"#)
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn metrics(&self) -> Result<QueueMetrics, AppError> {
        let depth: Vec<(String, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT mode,
                   COUNT(*) FILTER (WHERE status = 'queued' AND scheduled_for <= NOW()),
                   COUNT(*) FILTER (WHERE status = 'queued' AND scheduled_for > NOW()),
                   COUNT(*) FILTER (WHERE status = 'running')
            FROM tasks
            GROUP BY mode
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let consumers: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT mode, COUNT(*) FROM workers
            WHERE last_seen_at >= NOW() - $1 * INTERVAL '1 second'
            GROUP BY mode
            "#,
        )
        .bind(self.worker_ttl.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let statuses: Vec<(String, i64)> =
            sqlx::query_as(r#"SELECT status, COUNT(*) FROM tasks GROUP BY status"#)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;

        let (avg_duration_ms,): (Option<f64>,) = sqlx::query_as(
            r#"
            SELECT (AVG(EXTRACT(EPOCH FROM (completed_at - started_at))) * 1000)::FLOAT8
            FROM tasks
            WHERE status IN ('success', 'partial', 'failed', 'dlq', 'cancelled')
              AND started_at IS NOT NULL AND completed_at >= started_at
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let mut modes: Vec<ModeMetrics> = Mode::ALL.into_iter().map(ModeMetrics::empty).collect();
        for (mode, ready, delayed, running) in depth {
            let mode: Mode = mode.parse().map_err(AppError::DatabaseError)?;
            if let Some(m) = modes.iter_mut().find(|m| m.mode == mode) {
                m.ready = ready as u64;
                m.delayed = delayed as u64;
                m.running = running as u64;
            }
        }
        for (mode, count) in consumers {
            let mode: Mode = mode.parse().map_err(AppError::DatabaseError)?;
            if let Some(m) = modes.iter_mut().find(|m| m.mode == mode) {
                m.consumers = count as u64;
            }
        }

        let mut by_status = BTreeMap::new();
        for (status, count) in statuses {
            let status: TaskStatus = status.parse().map_err(AppError::DatabaseError)?;
            by_status.insert(status, count as u64);
        }

        Ok(QueueMetrics {
            modes,
            by_status,
            avg_duration_ms,
        })
    }

    async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(db_err)?;
        Ok(())
    }
}
