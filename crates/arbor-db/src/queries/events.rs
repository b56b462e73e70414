//! Database query functions for the `dag_events` table.
//!
//! Events are append-only. The `id` column (SQLite AUTOINCREMENT rowid) is
//! the monotonic per-store sequence number; callers write the returned
//! sequence back onto the live event before fan-out.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::EventRow;

/// Fields for a new event. The sequence number is assigned on insert.
#[derive(Debug, Clone)]
pub struct NewEvent<'a> {
    pub run_id: &'a str,
    pub event_type: &'a str,
    pub block_id: Option<&'a str>,
    pub data_json: &'a str,
    pub timestamp: DateTime<Utc>,
}

/// Append an event and return its assigned sequence number.
pub async fn append_event(pool: &SqlitePool, event: &NewEvent<'_>) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO dag_events (run_id, event_type, block_id, data_json, timestamp) \
         VALUES (?, ?, ?, ?, ?) \
         RETURNING id",
    )
    .bind(event.run_id)
    .bind(event.event_type)
    .bind(event.block_id)
    .bind(event.data_json)
    .bind(event.timestamp)
    .fetch_one(pool)
    .await
    .context("failed to append event")?;

    Ok(row.0)
}

/// Fetch all events for a run with sequence strictly greater than
/// `since_seq`, ordered ascending. Pass 0 to replay from the beginning.
pub async fn events_since(
    pool: &SqlitePool,
    run_id: &str,
    since_seq: i64,
) -> Result<Vec<EventRow>> {
    let rows = sqlx::query_as::<_, EventRow>(
        "SELECT * FROM dag_events \
         WHERE run_id = ? AND id > ? \
         ORDER BY id ASC",
    )
    .bind(run_id)
    .bind(since_seq)
    .fetch_all(pool)
    .await
    .context("failed to fetch events")?;

    Ok(rows)
}

/// The highest sequence number recorded for a run, or 0 if none.
pub async fn latest_seq(pool: &SqlitePool, run_id: &str) -> Result<i64> {
    let row: (Option<i64>,) =
        sqlx::query_as("SELECT MAX(id) FROM dag_events WHERE run_id = ?")
            .bind(run_id)
            .fetch_one(pool)
            .await
            .context("failed to fetch latest event sequence")?;

    Ok(row.0.unwrap_or(0))
}

/// Count events recorded for a run.
pub async fn count_events(pool: &SqlitePool, run_id: &str) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dag_events WHERE run_id = ?")
        .bind(run_id)
        .fetch_one(pool)
        .await
        .context("failed to count events")?;

    Ok(row.0)
}
