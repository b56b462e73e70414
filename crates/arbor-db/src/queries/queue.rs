//! Database query functions for the `dag_run_queue` table.
//!
//! The queue orders pending entries by `manual_rank ASC NULLS LAST`, then
//! `priority DESC`, then `created_at ASC`. Claims are lease-based: a claimed
//! entry whose lease expires without progressing to `running` is returned to
//! `pending` by the next claimer, so a crashed pump never wedges the queue.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{QueueEntry, QueueStatus};

/// The SQL ordering shared by head selection and position reporting.
const PENDING_ORDER: &str =
    "ORDER BY manual_rank ASC NULLS LAST, priority DESC, created_at ASC";

/// A successful claim.
#[derive(Debug, Clone)]
pub struct ClaimedEntry {
    pub run_id: String,
    pub claim_token: String,
    pub payload_json: String,
    pub attempt: i64,
}

/// Insert a new `pending` entry for a run.
pub async fn enqueue(
    pool: &SqlitePool,
    run_id: &str,
    priority: i64,
    manual_rank: Option<i64>,
    payload_json: &str,
) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO dag_run_queue (run_id, status, priority, manual_rank, payload_json, created_at, updated_at) \
         VALUES (?, 'pending', ?, ?, ?, ?, ?)",
    )
    .bind(run_id)
    .bind(priority)
    .bind(manual_rank)
    .bind(payload_json)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to enqueue run")?;

    Ok(())
}

/// Claim the head of the queue for `owner` with a lease of `lease_ms`.
///
/// Runs in a single transaction:
/// 1. Expire any `claimed` entries whose lease has elapsed back to `pending`.
/// 2. Select the head of the pending ordering.
/// 3. CAS-update it to `claimed` with a fresh claim token and lease.
///
/// Returns `None` when nothing is pending. A run id is claimed by at most
/// one owner at a time: step 3 re-checks `status = 'pending'`, so two
/// concurrent claimers cannot both win the same entry.
pub async fn claim_next(
    pool: &SqlitePool,
    owner: &str,
    lease_ms: i64,
) -> Result<Option<ClaimedEntry>> {
    let mut tx = pool.begin().await.context("failed to begin claim")?;
    let now = Utc::now();

    // 1. Return expired leases to pending.
    sqlx::query(
        "UPDATE dag_run_queue \
         SET status = 'pending', claim_owner = NULL, claim_token = NULL, \
             lease_expires_at = NULL, updated_at = ? \
         WHERE status = 'claimed' AND lease_expires_at < ?",
    )
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await
    .context("failed to expire stale leases")?;

    // 2. Select the head of the ordering.
    let head: Option<(String, String, i64)> = sqlx::query_as(&format!(
        "SELECT run_id, payload_json, attempt FROM dag_run_queue \
         WHERE status = 'pending' {PENDING_ORDER} LIMIT 1",
    ))
    .fetch_optional(&mut *tx)
    .await
    .context("failed to select queue head")?;

    let Some((run_id, payload_json, attempt)) = head else {
        tx.commit().await.context("failed to commit empty claim")?;
        return Ok(None);
    };

    // 3. CAS to claimed.
    let claim_token = Uuid::new_v4().to_string();
    let lease_expires_at = now + ChronoDuration::milliseconds(lease_ms);
    let updated = sqlx::query(
        "UPDATE dag_run_queue \
         SET status = 'claimed', claim_owner = ?, claim_token = ?, \
             lease_expires_at = ?, attempt = attempt + 1, updated_at = ? \
         WHERE run_id = ? AND status = 'pending'",
    )
    .bind(owner)
    .bind(&claim_token)
    .bind(lease_expires_at)
    .bind(now)
    .bind(&run_id)
    .execute(&mut *tx)
    .await
    .context("failed to claim queue head")?;

    tx.commit().await.context("failed to commit claim")?;

    if updated.rows_affected() == 0 {
        // Lost the race inside the transaction window; caller just retries.
        return Ok(None);
    }

    Ok(Some(ClaimedEntry {
        run_id,
        claim_token,
        payload_json,
        attempt: attempt + 1,
    }))
}

/// Transition a claimed entry to `running`. Verifies the claim token so a
/// pump holding a stale lease cannot clobber a re-claimed entry.
pub async fn mark_running(
    pool: &SqlitePool,
    run_id: &str,
    owner: &str,
    claim_token: &str,
    lease_ms: i64,
) -> Result<u64> {
    let now = Utc::now();
    let lease_expires_at = now + ChronoDuration::milliseconds(lease_ms);
    let result = sqlx::query(
        "UPDATE dag_run_queue \
         SET status = 'running', lease_expires_at = ?, started_at = COALESCE(started_at, ?), \
             updated_at = ? \
         WHERE run_id = ? AND status = 'claimed' AND claim_owner = ? AND claim_token = ?",
    )
    .bind(lease_expires_at)
    .bind(now)
    .bind(now)
    .bind(run_id)
    .bind(owner)
    .bind(claim_token)
    .execute(pool)
    .await
    .context("failed to mark queue entry running")?;

    Ok(result.rows_affected())
}

/// Move an entry to a terminal status, recording the error if any.
///
/// Idempotent: an entry already terminal is left untouched.
pub async fn mark_terminal(
    pool: &SqlitePool,
    run_id: &str,
    status: QueueStatus,
    last_error: Option<&str>,
) -> Result<u64> {
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE dag_run_queue \
         SET status = ?, last_error = ?, finished_at = COALESCE(finished_at, ?), \
             claim_owner = NULL, claim_token = NULL, lease_expires_at = NULL, updated_at = ? \
         WHERE run_id = ? AND status IN ('pending', 'claimed', 'running')",
    )
    .bind(status)
    .bind(last_error)
    .bind(now)
    .bind(now)
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to mark queue entry terminal")?;

    Ok(result.rows_affected())
}

/// Fetch a single queue entry.
pub async fn get_entry(pool: &SqlitePool, run_id: &str) -> Result<Option<QueueEntry>> {
    let entry =
        sqlx::query_as::<_, QueueEntry>("SELECT * FROM dag_run_queue WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch queue entry")?;

    Ok(entry)
}

/// List queue entries in queue order. Non-pending entries sort after
/// pending ones, newest first within their bucket.
pub async fn list_entries(pool: &SqlitePool, limit: i64) -> Result<Vec<QueueEntry>> {
    let entries = sqlx::query_as::<_, QueueEntry>(
        "SELECT * FROM dag_run_queue \
         ORDER BY CASE status \
             WHEN 'pending' THEN 0 \
             WHEN 'claimed' THEN 1 \
             WHEN 'running' THEN 2 \
             ELSE 3 END ASC, \
         manual_rank ASC NULLS LAST, priority DESC, created_at ASC \
         LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list queue entries")?;

    Ok(entries)
}

/// The 1-based position of a pending entry within the pending ordering, or
/// `None` if the entry is not pending.
pub async fn queue_position(pool: &SqlitePool, run_id: &str) -> Result<Option<i64>> {
    let pending: Vec<(String,)> = sqlx::query_as(&format!(
        "SELECT run_id FROM dag_run_queue WHERE status = 'pending' {PENDING_ORDER}",
    ))
    .fetch_all(pool)
    .await
    .context("failed to compute queue position")?;

    Ok(pending
        .iter()
        .position(|(id,)| id == run_id)
        .map(|index| index as i64 + 1))
}

/// Update priority and/or manual rank of a pending entry.
///
/// Returns 0 rows affected when the entry is missing or no longer pending
/// (the caller maps that to an invalid-state error).
pub async fn update_entry(
    pool: &SqlitePool,
    run_id: &str,
    priority: Option<i64>,
    manual_rank: Option<Option<i64>>,
) -> Result<u64> {
    let entry = match get_entry(pool, run_id).await? {
        Some(entry) => entry,
        None => return Ok(0),
    };

    let new_priority = priority.unwrap_or(entry.priority);
    let new_rank = manual_rank.unwrap_or(entry.manual_rank);

    let result = sqlx::query(
        "UPDATE dag_run_queue \
         SET priority = ?, manual_rank = ?, updated_at = ? \
         WHERE run_id = ? AND status = 'pending'",
    )
    .bind(new_priority)
    .bind(new_rank)
    .bind(Utc::now())
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to update queue entry")?;

    Ok(result.rows_affected())
}

/// Assign manual ranks 10, 20, 30, and so on following the given order. Entries not
/// listed keep their rank. Only pending entries are touched.
pub async fn reorder(pool: &SqlitePool, run_ids: &[String]) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to begin reorder")?;
    let now = Utc::now();
    let mut changed = 0;

    for (index, run_id) in run_ids.iter().enumerate() {
        let rank = (index as i64 + 1) * 10;
        let result = sqlx::query(
            "UPDATE dag_run_queue SET manual_rank = ?, updated_at = ? \
             WHERE run_id = ? AND status = 'pending'",
        )
        .bind(rank)
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .context("failed to reorder queue entry")?;
        changed += result.rows_affected();
    }

    tx.commit().await.context("failed to commit reorder")?;
    Ok(changed)
}

/// Cancel every pending or claimed entry. Returns the affected run ids.
pub async fn cancel_all_pending(pool: &SqlitePool) -> Result<Vec<String>> {
    let now = Utc::now();
    let rows: Vec<(String,)> = sqlx::query_as(
        "UPDATE dag_run_queue \
         SET status = 'cancelled', finished_at = ?, claim_owner = NULL, \
             claim_token = NULL, lease_expires_at = NULL, updated_at = ? \
         WHERE status IN ('pending', 'claimed') \
         RETURNING run_id",
    )
    .bind(now)
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to cancel pending queue entries")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Count entries currently holding an admission slot (claimed or running).
pub async fn count_in_flight(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM dag_run_queue WHERE status IN ('claimed', 'running')",
    )
    .fetch_one(pool)
    .await
    .context("failed to count in-flight queue entries")?;

    Ok(row.0)
}
