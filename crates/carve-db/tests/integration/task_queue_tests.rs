use std::collections::HashSet;
use std::time::Duration;

use carve_core::models::{ErrorKind, TaskError};
use carve_core::task::{AttemptReport, Outcome, RetryPolicy, TaskFilter, TaskStatus};
use carve_core::task_queue::TaskQueue;
use carve_core::traits::SchemaStore;
use carve_core::{AppError, Mode};
use carve_db::{Database, PgTaskRepository};

use crate::integration::common::{listing_schema, new_task, setup_test_db};

const LEASE: Duration = Duration::from_secs(30);

async fn queue(db: &Database) -> PgTaskRepository {
    db.schema_repo()
        .create_schema(listing_schema("listing", "shop"))
        .await
        .unwrap();
    db.task_repo_with_policy(RetryPolicy::immediate())
}

fn network_failure(attempt: u32) -> AttemptReport {
    AttemptReport::failed(
        TaskError::new(ErrorKind::FetchFailed, "connection reset", attempt),
        true,
    )
}

#[tokio::test]
#[ignore = "requires docker"]
async fn enqueue_admits_to_queue() {
    let (db, _container) = setup_test_db().await;
    let repo = queue(&db).await;

    let task = repo.enqueue(new_task(3, Mode::Http)).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.attempt, 0);

    let stored = repo.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Queued);
    assert_eq!(stored.history.len(), 1);
    assert_eq!(stored.history[0].from, TaskStatus::Pending);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn claims_by_priority_then_submission_order() {
    let (db, _container) = setup_test_db().await;
    let repo = queue(&db).await;

    let low = repo.enqueue(new_task(5, Mode::Http)).await.unwrap();
    let first = repo.enqueue(new_task(1, Mode::Http)).await.unwrap();
    let second = repo.enqueue(new_task(1, Mode::Http)).await.unwrap();
    repo.enqueue(new_task(1, Mode::Browser)).await.unwrap();

    let mut order = Vec::new();
    while let Some(task) = repo.claim_next(Mode::Http, "w1", LEASE).await.unwrap() {
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.worker_id.as_deref(), Some("w1"));
        assert_eq!(task.attempt, 1);
        order.push(task.id);
    }
    assert_eq!(order, [first.id, second.id, low.id]);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn concurrent_claims_hand_out_each_task_once() {
    let (db, _container) = setup_test_db().await;
    let repo = queue(&db).await;
    for _ in 0..5 {
        repo.enqueue(new_task(3, Mode::Http)).await.unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..10 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            repo.claim_next(Mode::Http, &format!("w{i}"), LEASE).await.unwrap()
        }));
    }
    let mut claimed = HashSet::new();
    for handle in handles {
        if let Some(task) = handle.await.unwrap() {
            assert!(claimed.insert(task.id), "task claimed twice");
        }
    }
    assert_eq!(claimed.len(), 5);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn repeated_failures_end_in_dlq_and_manual_retry_requeues() {
    let (db, _container) = setup_test_db().await;
    let repo = queue(&db).await;
    let task = repo.enqueue(new_task(3, Mode::Http)).await.unwrap();

    for attempt in 1..=3 {
        let claimed = repo.claim_next(Mode::Http, "w1", LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.attempt, attempt);
        repo.finish(task.id, "w1", network_failure(attempt)).await.unwrap();
    }

    let dead = repo.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(dead.status, TaskStatus::Dlq);
    assert_eq!(dead.errors.len(), 4);
    assert_eq!(dead.errors[3].kind, ErrorKind::MaxAttemptsExceeded);

    let retried = repo.retry(task.id).await.unwrap();
    assert_eq!(retried.status, TaskStatus::Queued);
    assert_eq!(retried.attempt, 3);
    assert!(matches!(
        repo.retry(task.id).await,
        Err(AppError::InvalidTransition { .. })
    ));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn heartbeat_reports_cancel_and_rejects_other_workers() {
    let (db, _container) = setup_test_db().await;
    let repo = queue(&db).await;
    let task = repo.enqueue(new_task(3, Mode::Http)).await.unwrap();
    repo.claim_next(Mode::Http, "w1", LEASE).await.unwrap().unwrap();

    assert!(!repo.heartbeat(task.id, "w1", LEASE).await.unwrap());
    assert!(matches!(
        repo.heartbeat(task.id, "w2", LEASE).await,
        Err(AppError::Conflict(_))
    ));

    let flagged = repo.cancel(task.id).await.unwrap();
    assert_eq!(flagged.status, TaskStatus::Running);
    assert!(repo.heartbeat(task.id, "w1", LEASE).await.unwrap());

    let report = AttemptReport {
        outcome: Outcome::Cancelled,
        records_saved: 4,
        records_rejected: 0,
        pages: 1,
        errors: vec![],
    };
    assert!(repo.finish(task.id, "w2", report.clone()).await.is_err());
    let done = repo.finish(task.id, "w1", report).await.unwrap();
    assert_eq!(done.status, TaskStatus::Cancelled);
    assert_eq!(done.records_extracted, 4);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn expired_leases_are_reclaimed() {
    let (db, _container) = setup_test_db().await;
    let repo = queue(&db).await;
    let task = repo.enqueue(new_task(3, Mode::Http)).await.unwrap();
    repo.claim_next(Mode::Http, "ghost", Duration::ZERO).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let reclaimed = repo.reclaim_expired().await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, task.id);
    assert_eq!(reclaimed[0].status, TaskStatus::Queued);
    assert_eq!(reclaimed[0].errors[0].kind, ErrorKind::LeaseExpired);
    assert!(repo.reclaim_expired().await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn list_filters_and_metrics() {
    let (db, _container) = setup_test_db().await;
    let repo = queue(&db).await;
    for _ in 0..3 {
        repo.enqueue(new_task(3, Mode::Http)).await.unwrap();
    }
    repo.enqueue(new_task(3, Mode::Browser)).await.unwrap();
    repo.register_worker("http-1", Mode::Http).await.unwrap();
    repo.claim_next(Mode::Http, "http-1", LEASE).await.unwrap().unwrap();

    let page = repo
        .list_tasks(&TaskFilter {
            mode: Some(Mode::Http),
            limit: 2,
            ..TaskFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.tasks.len(), 2);

    let running = repo
        .list_tasks(&TaskFilter::default().with_status(TaskStatus::Running))
        .await
        .unwrap();
    assert_eq!(running.total, 1);

    let metrics = repo.metrics().await.unwrap();
    let http = metrics.modes.iter().find(|m| m.mode == Mode::Http).unwrap();
    assert_eq!((http.ready, http.running, http.consumers), (2, 1, 1));
    assert_eq!(metrics.by_status[&TaskStatus::Queued], 3);

    repo.deregister_worker("http-1").await.unwrap();
    let metrics = repo.metrics().await.unwrap();
    assert_eq!(metrics.modes[0].consumers, 0);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn silent_workers_stop_counting_and_are_pruned() {
    let (db, _container) = setup_test_db().await;
    let repo = db.task_repo().with_worker_ttl(Duration::from_secs(1));
    repo.register_worker("crashed", Mode::Http).await.unwrap();
    repo.register_worker("polling", Mode::Http).await.unwrap();
    assert_eq!(repo.metrics().await.unwrap().modes[0].consumers, 2);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(repo.claim_next(Mode::Http, "polling", LEASE).await.unwrap().is_none());
    assert_eq!(repo.metrics().await.unwrap().modes[0].consumers, 1);

    repo.reclaim_expired().await.unwrap();
    let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM workers")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(rows, 1);
}
