//! Database query functions for the `dag_runs` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{RunRow, RunStatus};

/// Upsert a run snapshot. Idempotent by run id: the first write inserts the
/// full row, subsequent writes refresh `status`, `run_json`, `trace_json`,
/// and `updated_at` while leaving `created_at` and `dag_json` intact.
#[allow(clippy::too_many_arguments)]
pub async fn upsert_run(
    pool: &SqlitePool,
    id: &str,
    dag_name: &str,
    status: RunStatus,
    dag_json: &str,
    run_json: &str,
    trace_json: &str,
    created_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO dag_runs (id, dag_name, status, dag_json, run_json, trace_json, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (id) DO UPDATE SET \
             status = excluded.status, \
             run_json = excluded.run_json, \
             trace_json = excluded.trace_json, \
             updated_at = excluded.updated_at",
    )
    .bind(id)
    .bind(dag_name)
    .bind(status)
    .bind(dag_json)
    .bind(run_json)
    .bind(trace_json)
    .bind(created_at)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to upsert run")?;

    Ok(())
}

/// Fetch a single run row by id.
pub async fn run_row(pool: &SqlitePool, id: &str) -> Result<Option<RunRow>> {
    let row = sqlx::query_as::<_, RunRow>("SELECT * FROM dag_runs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch run")?;

    Ok(row)
}

/// Check whether a run row exists.
pub async fn run_exists(pool: &SqlitePool, id: &str) -> Result<bool> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dag_runs WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .context("failed to check run existence")?;

    Ok(row.0 > 0)
}

/// List run rows, newest first, optionally filtered by status.
pub async fn list_runs(
    pool: &SqlitePool,
    status: Option<RunStatus>,
    limit: i64,
    offset: i64,
) -> Result<Vec<RunRow>> {
    let rows = match status {
        Some(status) => {
            sqlx::query_as::<_, RunRow>(
                "SELECT * FROM dag_runs WHERE status = ? \
                 ORDER BY created_at DESC LIMIT ? OFFSET ?",
            )
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, RunRow>(
                "SELECT * FROM dag_runs ORDER BY created_at DESC LIMIT ? OFFSET ?",
            )
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
    }
    .context("failed to list runs")?;

    Ok(rows)
}

/// Count run rows, optionally filtered by status.
pub async fn count_runs(pool: &SqlitePool, status: Option<RunStatus>) -> Result<i64> {
    let row: (i64,) = match status {
        Some(status) => {
            sqlx::query_as("SELECT COUNT(*) FROM dag_runs WHERE status = ?")
                .bind(status)
                .fetch_one(pool)
                .await
        }
        None => {
            sqlx::query_as("SELECT COUNT(*) FROM dag_runs")
                .fetch_one(pool)
                .await
        }
    }
    .context("failed to count runs")?;

    Ok(row.0)
}

/// Find non-terminal runs whose snapshot has not been refreshed since
/// `cutoff`. Candidates for orphan reconciliation: the caller filters out
/// runs that still have a live executor before failing the rest.
pub async fn stale_active_runs(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<RunRow>> {
    let rows = sqlx::query_as::<_, RunRow>(
        "SELECT * FROM dag_runs \
         WHERE status IN ('pending', 'running', 'paused_approval') \
           AND updated_at < ? \
         ORDER BY updated_at ASC",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to scan for stale runs")?;

    Ok(rows)
}

/// Force a run row to a terminal status, refreshing its snapshot json.
///
/// Used by orphan reconciliation. The WHERE clause re-checks that the run is
/// still non-terminal so concurrent reconcilers stay idempotent. Returns the
/// number of rows affected (0 means another writer got there first).
pub async fn mark_run_terminal(
    pool: &SqlitePool,
    id: &str,
    status: RunStatus,
    run_json: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE dag_runs \
         SET status = ?, run_json = ?, updated_at = ? \
         WHERE id = ? AND status IN ('pending', 'running', 'paused_approval')",
    )
    .bind(status)
    .bind(run_json)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark run terminal")?;

    Ok(result.rows_affected())
}
