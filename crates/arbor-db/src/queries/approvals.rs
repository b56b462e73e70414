//! Database query functions for the `dag_approvals` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{ApprovalRow, ApprovalStatus};

/// Fields for a new approval request.
#[derive(Debug, Clone)]
pub struct NewApproval<'a> {
    pub token: &'a str,
    pub run_id: &'a str,
    pub block_id: &'a str,
    pub prompt: &'a str,
    pub requested_at: DateTime<Utc>,
    pub payload_json: &'a str,
}

/// Upsert an approval request. Idempotent by token: re-inserting an existing
/// token refreshes the prompt and payload but never resurrects a decided
/// request.
pub async fn upsert_approval(pool: &SqlitePool, approval: &NewApproval<'_>) -> Result<()> {
    sqlx::query(
        "INSERT INTO dag_approvals (token, run_id, block_id, status, prompt, requested_at, payload_json) \
         VALUES (?, ?, ?, 'pending', ?, ?, ?) \
         ON CONFLICT (token) DO UPDATE SET \
             prompt = excluded.prompt, \
             payload_json = excluded.payload_json \
         WHERE dag_approvals.status = 'pending'",
    )
    .bind(approval.token)
    .bind(approval.run_id)
    .bind(approval.block_id)
    .bind(approval.prompt)
    .bind(approval.requested_at)
    .bind(approval.payload_json)
    .execute(pool)
    .await
    .context("failed to upsert approval")?;

    Ok(())
}

/// Fetch an approval by token.
pub async fn get_approval(pool: &SqlitePool, token: &str) -> Result<Option<ApprovalRow>> {
    let row = sqlx::query_as::<_, ApprovalRow>("SELECT * FROM dag_approvals WHERE token = ?")
        .bind(token)
        .fetch_optional(pool)
        .await
        .context("failed to fetch approval")?;

    Ok(row)
}

/// The most recent pending approval for a run, if any.
pub async fn latest_pending_approval(
    pool: &SqlitePool,
    run_id: &str,
) -> Result<Option<ApprovalRow>> {
    let row = sqlx::query_as::<_, ApprovalRow>(
        "SELECT * FROM dag_approvals \
         WHERE run_id = ? AND status = 'pending' \
         ORDER BY requested_at DESC \
         LIMIT 1",
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest pending approval")?;

    Ok(row)
}

/// The most recent pending approval across all runs, if any.
pub async fn latest_pending_any(pool: &SqlitePool) -> Result<Option<ApprovalRow>> {
    let row = sqlx::query_as::<_, ApprovalRow>(
        "SELECT * FROM dag_approvals \
         WHERE status = 'pending' \
         ORDER BY requested_at DESC \
         LIMIT 1",
    )
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest pending approval")?;

    Ok(row)
}

/// Atomically decide a pending approval.
///
/// Uses optimistic locking: the WHERE clause requires `status = 'pending'`,
/// so a second decision on the same token affects zero rows. Returns the
/// number of rows affected.
pub async fn decide_approval(
    pool: &SqlitePool,
    token: &str,
    status: ApprovalStatus,
    approver: Option<&str>,
    notes: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE dag_approvals \
         SET status = ?, approver = ?, notes = ?, decided_at = ? \
         WHERE token = ? AND status = 'pending'",
    )
    .bind(status)
    .bind(approver)
    .bind(notes)
    .bind(Utc::now())
    .bind(token)
    .execute(pool)
    .await
    .context("failed to decide approval")?;

    Ok(result.rows_affected())
}

/// List all approvals for a run, newest first.
pub async fn list_approvals_for_run(
    pool: &SqlitePool,
    run_id: &str,
) -> Result<Vec<ApprovalRow>> {
    let rows = sqlx::query_as::<_, ApprovalRow>(
        "SELECT * FROM dag_approvals \
         WHERE run_id = ? \
         ORDER BY requested_at DESC",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await
    .context("failed to list approvals")?;

    Ok(rows)
}
