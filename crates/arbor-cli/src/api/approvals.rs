//! Approval endpoints: decide by run (+ optional token) and the tokenless
//! latest-approval convenience surface.

use axum::Json;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use serde_json::json;

use arbor_core::approval::ApprovalDecision;

use crate::serve_cmd::{AppError, AppState};

/// `POST /api/dag/runs/{id}/approvals` -- decide the latest pending request.
pub async fn decide(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(decision): Json<ApprovalDecision>,
) -> Result<axum::response::Response, AppError> {
    apply(state, id, None, decision).await
}

/// `POST /api/dag/runs/{id}/approvals/{token}` -- decide a specific request.
pub async fn decide_with_token(
    State(state): State<AppState>,
    Path((id, token)): Path<(String, String)>,
    Json(decision): Json<ApprovalDecision>,
) -> Result<axum::response::Response, AppError> {
    apply(state, id, Some(token), decision).await
}

async fn apply(
    state: AppState,
    run_id: String,
    token: Option<String>,
    decision: ApprovalDecision,
) -> Result<axum::response::Response, AppError> {
    let applied = state
        .engine
        .decide_approval(&run_id, token.as_deref(), decision)
        .await?;
    Ok(Json(json!({
        "ok": true,
        "decision": applied.decision,
        "run_status": applied.run_status,
        "iterated_run_id": applied.iterated_run_id,
    }))
    .into_response())
}

/// `GET /api/dag/approvals/latest` -- inspect the newest pending request
/// across all runs.
pub async fn latest(
    State(state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    let approval = state.engine.latest_pending_approval().await?;
    Ok(Json(json!({"approval": approval})).into_response())
}

/// `POST /api/dag/approvals/latest` -- decide the newest pending request.
pub async fn decide_latest(
    State(state): State<AppState>,
    Json(decision): Json<ApprovalDecision>,
) -> Result<axum::response::Response, AppError> {
    let approval = state
        .engine
        .latest_pending_approval()
        .await?
        .ok_or_else(|| AppError::not_found("no pending approvals"))?;
    let run_id = approval["run_id"]
        .as_str()
        .ok_or_else(|| AppError::not_found("no pending approvals"))?
        .to_owned();
    let token = approval["token"].as_str().map(str::to_owned);
    apply(state, run_id, token, decision).await
}
