//! Safety-cap introspection.

use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;

use crate::serve_cmd::{AppError, AppState};

/// `GET /api/dag/safety` -- the engine's effective caps.
pub async fn show(
    State(state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    Ok(Json(state.engine.safety()).into_response())
}
