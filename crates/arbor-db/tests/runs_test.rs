use chrono::{Duration, Utc};

use arbor_db::models::RunStatus;
use arbor_db::queries::runs;
use arbor_test_utils::create_test_db;

async fn insert_run(pool: &sqlx::SqlitePool, id: &str, status: RunStatus) {
    runs::upsert_run(
        pool,
        id,
        "test-dag",
        status,
        "{}",
        "{\"id\": \"stub\"}",
        "[]",
        Utc::now(),
    )
    .await
    .expect("upsert should succeed");
}

#[tokio::test]
async fn upsert_is_idempotent_by_id() {
    let (pool, _guard) = create_test_db().await;

    insert_run(&pool, "r1", RunStatus::Pending).await;
    insert_run(&pool, "r1", RunStatus::Running).await;

    let row = runs::run_row(&pool, "r1").await.unwrap().unwrap();
    assert_eq!(row.status, RunStatus::Running);
    assert_eq!(runs::count_runs(&pool, None).await.unwrap(), 1);
}

#[tokio::test]
async fn run_exists_and_missing() {
    let (pool, _guard) = create_test_db().await;

    assert!(!runs::run_exists(&pool, "nope").await.unwrap());
    insert_run(&pool, "r1", RunStatus::Pending).await;
    assert!(runs::run_exists(&pool, "r1").await.unwrap());
    assert!(runs::run_row(&pool, "nope").await.unwrap().is_none());
}

#[tokio::test]
async fn list_runs_filters_by_status() {
    let (pool, _guard) = create_test_db().await;

    insert_run(&pool, "r1", RunStatus::Completed).await;
    insert_run(&pool, "r2", RunStatus::Running).await;
    insert_run(&pool, "r3", RunStatus::Completed).await;

    let completed = runs::list_runs(&pool, Some(RunStatus::Completed), 10, 0)
        .await
        .unwrap();
    assert_eq!(completed.len(), 2);

    let all = runs::list_runs(&pool, None, 10, 0).await.unwrap();
    assert_eq!(all.len(), 3);

    let paged = runs::list_runs(&pool, None, 2, 2).await.unwrap();
    assert_eq!(paged.len(), 1);

    assert_eq!(
        runs::count_runs(&pool, Some(RunStatus::Completed))
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn stale_scan_only_returns_old_active_runs() {
    let (pool, _guard) = create_test_db().await;

    insert_run(&pool, "active-fresh", RunStatus::Running).await;
    insert_run(&pool, "terminal", RunStatus::Completed).await;

    // Nothing is older than a cutoff in the past.
    let past_cutoff = Utc::now() - Duration::minutes(5);
    let stale = runs::stale_active_runs(&pool, past_cutoff).await.unwrap();
    assert!(stale.is_empty());

    // With a future cutoff, only the non-terminal run qualifies.
    let future_cutoff = Utc::now() + Duration::minutes(5);
    let stale = runs::stale_active_runs(&pool, future_cutoff).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, "active-fresh");
}

#[tokio::test]
async fn mark_run_terminal_is_a_cas() {
    let (pool, _guard) = create_test_db().await;

    insert_run(&pool, "r1", RunStatus::Running).await;

    let first = runs::mark_run_terminal(&pool, "r1", RunStatus::Failed, "{}")
        .await
        .unwrap();
    assert_eq!(first, 1);

    // Second reconciliation pass is a no-op.
    let second = runs::mark_run_terminal(&pool, "r1", RunStatus::Failed, "{}")
        .await
        .unwrap();
    assert_eq!(second, 0);

    let row = runs::run_row(&pool, "r1").await.unwrap().unwrap();
    assert_eq!(row.status, RunStatus::Failed);
}
