//! In-process implementations of the storage traits.
//!
//! Backs local one-shot runs and tests. All state sits behind one mutex,
//! which makes every queue operation trivially atomic.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{ExtractedRecord, Mode, NewRecord};
use crate::schema::{NewSchema, ParsingSchema, SchemaDefinition, SchemaFilter};
use crate::state::{TaskEvent, apply};
use crate::stats::{ModeMetrics, QueueMetrics};
use crate::task::{AttemptReport, NewTask, RetryPolicy, Task, TaskFilter, TaskPage, TaskStatus};
use crate::task_queue::{TaskQueue, WORKER_TTL};
use crate::traits::{RecordStore, SchemaStore};

#[derive(Default)]
struct State {
    /// All versions per schema, oldest first.
    schemas: BTreeMap<String, Vec<ParsingSchema>>,
    tasks: HashMap<Uuid, Task>,
    /// Submission order, for FIFO within a priority.
    seq: HashMap<Uuid, u64>,
    next_seq: u64,
    /// Registered consumers and when each was last seen.
    workers: HashMap<String, (Mode, DateTime<Utc>)>,
}

impl State {
    fn touch_worker(&mut self, worker_id: &str, now: DateTime<Utc>) {
        if let Some((_, seen)) = self.workers.get_mut(worker_id) {
            *seen = now;
        }
    }

    fn task_mut(&mut self, task_id: Uuid) -> Result<&mut Task, AppError> {
        self.tasks
            .get_mut(&task_id)
            .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))
    }

    fn set_active(&mut self, schema_id: &str, active: bool) {
        if let Some(versions) = self.schemas.get_mut(schema_id) {
            for v in versions {
                v.is_active = active;
            }
        }
    }

    /// Make `schema_id` the only active schema of its source.
    fn activate(&mut self, schema_id: &str, source_id: &str) {
        let others: Vec<String> = self
            .schemas
            .iter()
            .filter(|(id, versions)| {
                id.as_str() != schema_id
                    && versions.last().is_some_and(|v| v.source_id == source_id && v.is_active)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in others {
            tracing::info!(schema_id = %id, %source_id, "Deactivating superseded schema");
            self.set_active(&id, false);
        }
        self.set_active(schema_id, true);
    }
}

/// Task queue and schema store held in memory.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    retry_policy: RetryPolicy,
    worker_ttl: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            retry_policy: RetryPolicy::default(),
            worker_ttl: WORKER_TTL,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_worker_ttl(mut self, ttl: Duration) -> Self {
        self.worker_ttl = ttl;
        self
    }

    fn worker_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.worker_ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lease_until(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + TimeDelta::from_std(lease).unwrap_or_else(|_| TimeDelta::days(1))
}

impl TaskQueue for MemoryStore {
    async fn enqueue(&self, new: NewTask) -> Result<Task, AppError> {
        let now = Utc::now();
        let mut task = Task::new(new, now);
        apply(&mut task, TaskEvent::Admit, &self.retry_policy, now)?;

        let mut state = self.state();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.seq.insert(task.id, seq);
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn claim_next(
        &self,
        mode: Mode,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Task>, AppError> {
        let now = Utc::now();
        let mut state = self.state();
        state.touch_worker(worker_id, now);
        let next = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued && t.mode == mode && t.scheduled_for <= now)
            .min_by_key(|t| (t.priority, t.scheduled_for, state.seq.get(&t.id).copied()))
            .map(|t| t.id);
        let Some(task_id) = next else {
            return Ok(None);
        };

        let task = state.task_mut(task_id)?;
        apply(
            task,
            TaskEvent::Claim {
                worker_id: worker_id.to_string(),
                lease_until: lease_until(now, lease),
            },
            &self.retry_policy,
            now,
        )?;
        Ok(Some(task.clone()))
    }

    async fn heartbeat(&self, task_id: Uuid, worker_id: &str, lease: Duration) -> Result<bool, AppError> {
        let now = Utc::now();
        let mut state = self.state();
        state.touch_worker(worker_id, now);
        let task = state.task_mut(task_id)?;
        task.ensure_held_by(worker_id)?;
        task.lease_expires_at = Some(lease_until(now, lease));
        task.updated_at = now;
        Ok(task.cancel_requested)
    }

    async fn finish(&self, task_id: Uuid, worker_id: &str, report: AttemptReport) -> Result<Task, AppError> {
        let now = Utc::now();
        let mut state = self.state();
        let task = state.task_mut(task_id)?;
        task.ensure_held_by(worker_id)?;
        apply(task, TaskEvent::Finish(report), &self.retry_policy, now)?;
        Ok(task.clone())
    }

    async fn retry(&self, task_id: Uuid) -> Result<Task, AppError> {
        let now = Utc::now();
        let mut state = self.state();
        let task = state.task_mut(task_id)?;
        apply(task, TaskEvent::Retry, &self.retry_policy, now)?;
        Ok(task.clone())
    }

    async fn cancel(&self, task_id: Uuid) -> Result<Task, AppError> {
        let now = Utc::now();
        let mut state = self.state();
        let task = state.task_mut(task_id)?;
        apply(task, TaskEvent::Cancel, &self.retry_policy, now)?;
        Ok(task.clone())
    }

    async fn reclaim_expired(&self) -> Result<Vec<Task>, AppError> {
        let now = Utc::now();
        let mut state = self.state();
        let mut reclaimed = Vec::new();
        for task in state.tasks.values_mut() {
            let expired = task.status == TaskStatus::Running
                && task.lease_expires_at.is_some_and(|at| at < now);
            if !expired {
                continue;
            }
            // The rest of the sweep still runs when one task refuses.
            match apply(task, TaskEvent::LeaseExpired, &self.retry_policy, now) {
                Ok(()) => reclaimed.push(task.clone()),
                Err(e) => tracing::error!(task_id = %task.id, error = %e, "Failed to reclaim expired lease"),
            }
        }

        let cutoff = self.worker_cutoff(now);
        let before = state.workers.len();
        state.workers.retain(|_, (_, seen)| *seen >= cutoff);
        let pruned = before - state.workers.len();
        if pruned > 0 {
            tracing::info!(count = pruned, "Pruned stale worker registrations");
        }
        Ok(reclaimed)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, AppError> {
        Ok(self.state().tasks.get(&task_id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<TaskPage, AppError> {
        let state = self.state();
        let mut matching: Vec<&Task> = state.tasks.values().filter(|t| filter.matches(t)).collect();
        matching.sort_by_key(|t| std::cmp::Reverse(state.seq.get(&t.id).copied()));
        Ok(TaskPage {
            total: matching.len() as u64,
            tasks: matching
                .into_iter()
                .skip(filter.offset)
                .take(filter.limit)
                .cloned()
                .collect(),
        })
    }

    async fn register_worker(&self, worker_id: &str, mode: Mode) -> Result<(), AppError> {
        self.state().workers.insert(worker_id.to_string(), (mode, Utc::now()));
        Ok(())
    }

    async fn deregister_worker(&self, worker_id: &str) -> Result<(), AppError> {
        self.state().workers.remove(worker_id);
        Ok(())
    }

    async fn metrics(&self) -> Result<QueueMetrics, AppError> {
        let now = Utc::now();
        let state = self.state();
        let mut modes: Vec<ModeMetrics> = Mode::ALL.into_iter().map(ModeMetrics::empty).collect();
        let mut by_status = BTreeMap::new();
        let mut durations = Vec::new();

        for task in state.tasks.values() {
            *by_status.entry(task.status).or_insert(0) += 1;
            if task.status.is_terminal() {
                if let Some(d) = task.duration() {
                    durations.push(d.num_milliseconds() as f64);
                }
            }
            let Some(m) = modes.iter_mut().find(|m| m.mode == task.mode) else {
                continue;
            };
            match task.status {
                TaskStatus::Queued if task.scheduled_for <= now => m.ready += 1,
                TaskStatus::Queued => m.delayed += 1,
                TaskStatus::Running => m.running += 1,
                _ => {}
            }
        }
        let cutoff = self.worker_cutoff(now);
        for (mode, seen) in state.workers.values() {
            if *seen < cutoff {
                continue;
            }
            if let Some(m) = modes.iter_mut().find(|m| m.mode == *mode) {
                m.consumers += 1;
            }
        }

        let avg_duration_ms =
            (!durations.is_empty()).then(|| durations.iter().sum::<f64>() / durations.len() as f64);
        Ok(QueueMetrics {
            modes,
            by_status,
            avg_duration_ms,
        })
    }
}

impl SchemaStore for MemoryStore {
    async fn create_schema(&self, schema: NewSchema) -> Result<ParsingSchema, AppError> {
        schema.validate()?;
        let mut state = self.state();
        if state.schemas.contains_key(&schema.schema_id) {
            return Err(AppError::Conflict(format!(
                "schema '{}' already exists; publish a new version instead",
                schema.schema_id
            )));
        }
        let created = ParsingSchema {
            schema_id: schema.schema_id.clone(),
            source_id: schema.source_id.clone(),
            version: 1,
            is_active: true,
            created_at: Utc::now(),
            definition: schema.definition,
        };
        state.schemas.insert(created.schema_id.clone(), vec![created.clone()]);
        state.activate(&created.schema_id, &created.source_id);
        Ok(created)
    }

    async fn publish_version(
        &self,
        schema_id: &str,
        definition: SchemaDefinition,
    ) -> Result<ParsingSchema, AppError> {
        definition.validate()?;
        let mut state = self.state();
        let latest = state
            .schemas
            .get(schema_id)
            .and_then(|versions| versions.last())
            .ok_or_else(|| AppError::NotFound(format!("schema {schema_id}")))?;
        let published = ParsingSchema {
            schema_id: schema_id.to_string(),
            source_id: latest.source_id.clone(),
            version: latest.version + 1,
            is_active: true,
            created_at: Utc::now(),
            definition,
        };
        if let Some(versions) = state.schemas.get_mut(schema_id) {
            versions.push(published.clone());
        }
        state.activate(schema_id, &published.source_id);
        Ok(published)
    }

    async fn get_schema(&self, schema_id: &str, version: Option<u32>) -> Result<Option<ParsingSchema>, AppError> {
        let state = self.state();
        let Some(versions) = state.schemas.get(schema_id) else {
            return Ok(None);
        };
        Ok(match version {
            Some(v) => versions.iter().find(|s| s.version == v).cloned(),
            None => versions.last().cloned(),
        })
    }

    async fn list_schemas(&self, filter: &SchemaFilter) -> Result<Vec<ParsingSchema>, AppError> {
        Ok(self
            .state()
            .schemas
            .values()
            .filter_map(|versions| versions.last())
            .filter(|s| filter.source_id.as_deref().is_none_or(|id| id == s.source_id))
            .filter(|s| !filter.active_only || s.is_active)
            .cloned()
            .collect())
    }

    async fn deactivate_schema(&self, schema_id: &str) -> Result<(), AppError> {
        let mut state = self.state();
        if !state.schemas.contains_key(schema_id) {
            return Err(AppError::NotFound(format!("schema {schema_id}")));
        }
        state.set_active(schema_id, false);
        Ok(())
    }

    async fn list_versions(&self, schema_id: &str) -> Result<Vec<ParsingSchema>, AppError> {
        Ok(self.state().schemas.get(schema_id).cloned().unwrap_or_default())
    }

    async fn activate_schema(&self, schema_id: &str) -> Result<(), AppError> {
        let mut state = self.state();
        let source_id = state
            .schemas
            .get(schema_id)
            .and_then(|versions| versions.last())
            .map(|latest| latest.source_id.clone())
            .ok_or_else(|| AppError::NotFound(format!("schema {schema_id}")))?;
        state.activate(schema_id, &source_id);
        Ok(())
    }
}

/// Record store held in memory.
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    records: Arc<Mutex<HashMap<Uuid, Vec<ExtractedRecord>>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, task_id: Uuid) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&task_id)
            .map_or(0, Vec::len)
    }
}

impl RecordStore for MemoryRecordStore {
    async fn save_page(&self, task_id: Uuid, records: &[NewRecord]) -> Result<u64, AppError> {
        let now = Utc::now();
        let mut all = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = all.entry(task_id).or_default();
        let mut known: HashSet<String> = stored.iter().map(|r| r.record_hash.clone()).collect();
        let mut saved = 0;
        for record in records {
            if known.insert(record.record_hash.clone()) {
                stored.push(ExtractedRecord {
                    task_id,
                    record_hash: record.record_hash.clone(),
                    page: record.page,
                    data: record.data.clone(),
                    created_at: now,
                });
                saved += 1;
            }
        }
        Ok(saved)
    }

    async fn list_records(&self, task_id: Uuid, limit: usize, offset: usize) -> Result<Vec<ExtractedRecord>, AppError> {
        let all = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(all
            .get(&task_id)
            .map(|stored| stored.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
