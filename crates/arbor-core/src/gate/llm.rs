//! LLM-review gate support: the pluggable reviewer trait and its outcome
//! types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-criterion verdict from a reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Aggregate review verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub passed: bool,
    pub score: f64,
    pub criteria_results: Vec<CriterionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

/// Adapter interface for LLM-backed output review.
///
/// Implementors wrap a model call that scores `output` against each
/// criterion. The gate passes when the aggregate score clears its
/// threshold; the trait itself carries no threshold.
///
/// # Object Safety
///
/// Object-safe so a reviewer can be stored as `Arc<dyn LlmReviewProvider>`
/// on the engine.
#[async_trait]
pub trait LlmReviewProvider: Send + Sync {
    async fn review(&self, output: &Value, criteria: &[String]) -> anyhow::Result<ReviewOutcome>;
}

// Compile-time assertion: LlmReviewProvider must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn LlmReviewProvider) {}
};
