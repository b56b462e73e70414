//! Queue introspection and re-prioritization.

use axum::Json;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;

use arbor_db::models::Priority;

use crate::serve_cmd::{AppError, AppState};

/// `GET /api/dag/queue`.
pub async fn list(
    State(state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    let entries = state.engine.queue_entries().await?;
    Ok(Json(json!({"queue": entries})).into_response())
}

#[derive(Debug, Deserialize)]
pub struct UpdateBody {
    pub priority: Option<Priority>,
    pub manual_rank: Option<i64>,
    /// Set true to clear an existing manual rank.
    #[serde(default)]
    pub clear_manual_rank: bool,
}

/// `PATCH /api/dag/queue/{id}` -- adjust a pending entry.
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateBody>,
) -> Result<axum::response::Response, AppError> {
    let manual_rank = if body.clear_manual_rank {
        Some(None)
    } else {
        body.manual_rank.map(Some)
    };
    state
        .engine
        .update_queue_entry(&id, body.priority, manual_rank)
        .await?;
    Ok(Json(json!({"ok": true})).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ReorderBody {
    pub run_ids: Vec<String>,
}

/// `POST /api/dag/queue/reorder` -- manual ranks follow the given order.
pub async fn reorder(
    State(state): State<AppState>,
    Json(body): Json<ReorderBody>,
) -> Result<axum::response::Response, AppError> {
    let changed = state.engine.reorder_queue(&body.run_ids).await?;
    Ok(Json(json!({"ok": true, "changed": changed})).into_response())
}
