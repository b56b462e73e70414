//! Run lifecycle endpoints: start/enqueue, inspect, replay, stop.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;

use arbor_core::graph::examples::example_names;
use arbor_core::run::StartRequest;
use arbor_db::models::RunStatus;

use crate::serve_cmd::{AppError, AppState, client_key};

/// `POST /api/dag/run` -- 201 when started, 202 when queued.
pub async fn start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StartRequest>,
) -> Result<axum::response::Response, AppError> {
    if !state.limiter.check(&client_key(&headers)) {
        return Err(AppError::rate_limited());
    }

    let submission = state.engine.submit(req).await?;
    let status = if submission.queued {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CREATED
    };

    let body = json!({
        "run_id": submission.run_id,
        "dag_name": submission.dag_name,
        "blocks": submission.blocks,
        "edges": submission.edges,
        "sse_url": format!("/api/dag/runs/{}/events", submission.run_id),
        "queued": submission.queued,
        "queue": submission.queue,
    });

    Ok((status, Json(body)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub status: Option<RunStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// `GET /api/dag/runs` -- active + durable runs, newest first.
pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<axum::response::Response, AppError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    let offset = params.offset.unwrap_or(0).max(0);
    let (rows, total) = state.engine.list_runs(params.status, limit, offset).await?;

    let runs: Vec<_> = rows
        .iter()
        .map(|row| {
            json!({
                "id": row.id,
                "dag_name": row.dag_name,
                "status": row.status,
                "active": state.engine.is_active(&row.id),
                "created_at": row.created_at,
                "updated_at": row.updated_at,
            })
        })
        .collect();

    Ok(Json(json!({
        "runs": runs,
        "pagination": {"total": total, "limit": limit, "offset": offset},
    }))
    .into_response())
}

/// `GET /api/dag/runs/{id}` -- full state + events + dag.
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, AppError> {
    let view = state.engine.run_state(&id).await?;
    Ok(Json(json!({
        "run": view.run,
        "status": view.status,
        "dag": view.dag,
        "approval": view.approval,
        "events": view.events,
        "trace": view.trace,
        "durable": view.durable,
        "reconstructed": view.reconstructed,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct ReplayParams {
    #[serde(default)]
    pub since: i64,
}

/// `GET /api/dag/runs/{id}/replay?since=N`.
pub async fn replay(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ReplayParams>,
) -> Result<axum::response::Response, AppError> {
    let (events, next_since) = state.engine.replay(&id, params.since).await?;
    Ok(Json(json!({"events": events, "next_since": next_since})).into_response())
}

/// `POST /api/dag/runs/{id}/stop`.
pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, AppError> {
    let mode = state.engine.stop_run(&id).await?;
    Ok(Json(json!({"status": "cancelled", "mode": mode})).into_response())
}

/// `POST /api/dag/runs/stop-all` -- emergency stop.
pub async fn stop_all(
    State(state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    let (stopped, cancelled_queued) = state.engine.stop_all().await?;
    Ok(Json(json!({
        "ok": true,
        "stopped": stopped,
        "cancelled_queued": cancelled_queued,
    }))
    .into_response())
}

/// `GET /api/dag/examples` -- names resolvable via `{"example": ...}`.
pub async fn examples(
    State(_state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    Ok(Json(json!({"examples": example_names()})).into_response())
}
