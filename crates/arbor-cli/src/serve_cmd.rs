//! The HTTP control plane: router construction, the error envelope, and
//! request guards (auth, body size, rate limit).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;

use arbor_core::engine::Engine;
use arbor_core::errors::{EngineError, ErrorCode};
use arbor_core::safety::RateLimiter;

use crate::api;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        let limiter = Arc::new(RateLimiter::from_limits(engine.limits()));
        Self { engine, limiter }
    }
}

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

/// HTTP error shape: `{error, code, details?}` with a status mapped from
/// the engine error code.
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
}

impl AppError {
    pub fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorCode::NotFound, message)
    }

    pub fn rate_limited() -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::RateLimited,
            "rate limit exceeded",
        )
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            ErrorCode::Unauthorized,
            "missing or invalid API key",
        )
    }

    pub fn too_large(limit: usize) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::RequestTooLarge,
            format!("request body exceeds {limit} bytes"),
        )
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let status = match err.code {
            ErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorCode::ExampleNotFound | ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::RateLimited | ErrorCode::ConcurrencyLimit => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::InvalidState => StatusCode::CONFLICT,
            ErrorCode::NoPendingApproval => StatusCode::BAD_REQUEST,
            ErrorCode::InvalidApprovalToken => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: err.code.to_string(),
            message: err.message,
            details: err.details,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.message, "code": self.code });
        if let Some(details) = self.details {
            body["details"] = details;
        }
        (self.status, axum::Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// Client key for rate limiting: forwarded address if present, else a
/// shared bucket.
pub fn client_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_owned())
        .unwrap_or_else(|| "local".to_owned())
}

/// Bearer / X-API-Key auth, enforced only when a key is configured.
async fn auth_guard(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(expected) = state.engine.limits().api_key.clone() else {
        return Ok(next.run(request).await);
    };

    let headers = request.headers();
    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_owned)
        });

    match presented {
        Some(key) if key == expected => Ok(next.run(request).await),
        _ => Err(AppError::unauthorized()),
    }
}

/// Early 413 with our envelope when Content-Length already exceeds the cap
/// (the body-limit layer backstops chunked bodies).
async fn size_guard(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let limit = state.engine.limits().max_request_bytes;
    let declared = request
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(declared) = declared {
        if declared > limit {
            return Err(AppError::too_large(limit));
        }
    }
    Ok(next.run(request).await)
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.engine.limits().max_request_bytes;
    Router::new()
        .route("/api/dag/run", post(api::runs::start))
        .route("/api/dag/runs", get(api::runs::list))
        .route("/api/dag/runs/stop-all", post(api::runs::stop_all))
        .route("/api/dag/runs/{id}", get(api::runs::get))
        .route("/api/dag/runs/{id}/replay", get(api::runs::replay))
        .route("/api/dag/runs/{id}/events", get(api::events::stream))
        .route("/api/dag/runs/{id}/stop", post(api::runs::stop))
        .route(
            "/api/dag/runs/{id}/approvals",
            post(api::approvals::decide),
        )
        .route(
            "/api/dag/runs/{id}/approvals/{token}",
            post(api::approvals::decide_with_token),
        )
        .route(
            "/api/dag/approvals/latest",
            get(api::approvals::latest).post(api::approvals::decide_latest),
        )
        .route("/api/dag/queue", get(api::queue::list))
        .route("/api/dag/queue/{id}", patch(api::queue::update))
        .route("/api/dag/queue/reorder", post(api::queue::reorder))
        .route("/api/dag/safety", get(api::safety::show))
        .route("/api/dag/examples", get(api::runs::examples))
        .layer(middleware::from_fn_with_state(state.clone(), auth_guard))
        .layer(middleware::from_fn_with_state(state.clone(), size_guard))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(engine: Engine, bind: &str, port: u16) -> Result<()> {
    engine.start_background();
    let state = AppState::new(engine.clone());
    let app = build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("arbor serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    engine.shutdown();
    tracing::info!("arbor serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
