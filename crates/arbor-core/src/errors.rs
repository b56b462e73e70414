//! Engine error taxonomy.
//!
//! Errors are surfaced as code strings (the `ErrorCode` enum) rather than a
//! deep exception hierarchy: runtime failures land on block instances and
//! become `block:fail` events, admission failures return to the caller, and
//! the HTTP layer maps codes to statuses.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable error code strings shared across block failures, engine errors,
/// and the HTTP error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Input & admission
    InvalidInput,
    ExampleNotFound,
    RequestTooLarge,
    RateLimited,
    Unauthorized,
    ConcurrencyLimit,
    InvalidState,
    NotFound,
    // Runtime
    MissingInput,
    DispatchFailed,
    Timeout,
    ContractFailed,
    ShellGatesDisabled,
    BudgetExceeded,
    OrphanedRun,
    StallTimeout,
    Cancelled,
    // Approval
    NoPendingApproval,
    InvalidApprovalToken,
    MaxCyclesReached,
    // Gate failures
    PreGateFailed,
    // Retry exhaustion
    GateExhaustion,
    // Persistence
    SnapshotFailed,
}

impl ErrorCode {
    /// The wire string, e.g. `BUDGET_EXCEEDED`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::ExampleNotFound => "EXAMPLE_NOT_FOUND",
            Self::RequestTooLarge => "REQUEST_TOO_LARGE",
            Self::RateLimited => "RATE_LIMITED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::ConcurrencyLimit => "CONCURRENCY_LIMIT",
            Self::InvalidState => "INVALID_STATE",
            Self::NotFound => "NOT_FOUND",
            Self::MissingInput => "MISSING_INPUT",
            Self::DispatchFailed => "DISPATCH_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::ContractFailed => "CONTRACT_FAILED",
            Self::ShellGatesDisabled => "SHELL_GATES_DISABLED",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::OrphanedRun => "ORPHANED_RUN",
            Self::StallTimeout => "STALL_TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::NoPendingApproval => "NO_PENDING_APPROVAL",
            Self::InvalidApprovalToken => "INVALID_APPROVAL_TOKEN",
            Self::MaxCyclesReached => "MAX_CYCLES_REACHED",
            Self::PreGateFailed => "PRE_GATE_FAILED",
            Self::GateExhaustion => "GATE_EXHAUSTION",
            Self::SnapshotFailed => "SNAPSHOT_FAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed engine error: a code, a human-readable message, and optional
/// structured details for the HTTP envelope.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Value>,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidState, message)
    }

    /// Wrap an unexpected internal failure (DB errors and the like) without
    /// losing the underlying message.
    pub fn internal(err: anyhow::Error) -> Self {
        Self::new(ErrorCode::SnapshotFailed, format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_wire_strings() {
        assert_eq!(ErrorCode::BudgetExceeded.as_str(), "BUDGET_EXCEEDED");
        assert_eq!(ErrorCode::NoPendingApproval.as_str(), "NO_PENDING_APPROVAL");
        assert_eq!(ErrorCode::GateExhaustion.as_str(), "GATE_EXHAUSTION");
    }

    #[test]
    fn error_code_serde_matches_as_str() {
        let json = serde_json::to_string(&ErrorCode::ShellGatesDisabled).unwrap();
        assert_eq!(json, "\"SHELL_GATES_DISABLED\"");
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorCode::ShellGatesDisabled);
    }

    #[test]
    fn engine_error_display() {
        let err = EngineError::invalid_input("dag has a cycle");
        assert_eq!(err.to_string(), "INVALID_INPUT: dag has a cycle");
    }
}
