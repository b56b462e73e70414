//! Gate engine: pure evaluators over produced values with structured
//! pass/fail results and audit records.
//!
//! A gate is a tagged variant ([`GateSpec`]). Evaluators never panic and
//! never mutate the value under test; the only effectful variant is the
//! opt-in shell gate, which runs an argv command.

pub mod expr;
pub mod llm;
pub mod schema;
pub mod shell;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::gate::llm::LlmReviewProvider;
use crate::gate::schema::validate_value;

/// Where a gate list sits relative to dispatch. Shell gates are legal only
/// as pre-gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePhase {
    Pre,
    Post,
}

/// Default score threshold for llm_review gates.
pub const DEFAULT_REVIEW_THRESHOLD: f64 = 0.8;

fn default_threshold() -> f64 {
    DEFAULT_REVIEW_THRESHOLD
}

fn default_shell_timeout_ms() -> u64 {
    60_000
}

/// A gate specification, as authored in a DAG definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateSpec {
    /// Validate the value against a JSON-schema subset.
    JsonSchema { schema: Value },
    /// Evaluate a sandboxed boolean expression over the value's keys.
    Expression { expr: String },
    /// Bound the whitespace-split word count of the value (as a string).
    WordCount {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<usize>,
    },
    /// Delegate to the configured LLM reviewer.
    LlmReview {
        criteria: Vec<String>,
        #[serde(default = "default_threshold")]
        threshold: f64,
    },
    /// Run an argv command (pre-gate only, opt-in via env).
    Shell {
        command: Vec<String>,
        #[serde(default)]
        expected_exit_code: i32,
        #[serde(default = "default_shell_timeout_ms")]
        timeout_ms: u64,
    },
}

impl GateSpec {
    /// A short label used in results and retry feedback, e.g.
    /// `expression(price > 100)`.
    pub fn label(&self) -> String {
        match self {
            Self::JsonSchema { .. } => "json_schema".to_owned(),
            Self::Expression { expr } => format!("expression({expr})"),
            Self::WordCount { min, max } => format!(
                "word_count({}..{})",
                min.map(|n| n.to_string()).unwrap_or_default(),
                max.map(|n| n.to_string()).unwrap_or_default(),
            ),
            Self::LlmReview { threshold, .. } => format!("llm_review(threshold={threshold})"),
            Self::Shell { command, .. } => format!("shell({})", command.join(" ")),
        }
    }

    /// The wire name of the variant.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::JsonSchema { .. } => "json_schema",
            Self::Expression { .. } => "expression",
            Self::WordCount { .. } => "word_count",
            Self::LlmReview { .. } => "llm_review",
            Self::Shell { .. } => "shell",
        }
    }
}

/// The outcome of evaluating one gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    /// The gate's label.
    pub gate: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit: Option<Value>,
}

impl GateResult {
    fn pass(gate: String, duration_ms: u64) -> Self {
        Self {
            gate,
            passed: true,
            reason: None,
            details: None,
            duration_ms,
            audit: None,
        }
    }

    fn fail(gate: String, reason: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            gate,
            passed: false,
            reason: Some(reason.into()),
            details: None,
            duration_ms,
            audit: None,
        }
    }

    /// Whether this failure came from a blocked (disabled) shell gate.
    pub fn is_shell_blocked(&self) -> bool {
        self.audit
            .as_ref()
            .map(|audit| audit["status"] == "blocked" && audit["gate_type"] == "shell")
            .unwrap_or(false)
    }
}

/// Ambient inputs for gate evaluation.
#[derive(Clone, Default)]
pub struct GateContext {
    /// Reviewer backing llm_review gates. Absent means those gates fail.
    pub llm: Option<Arc<dyn LlmReviewProvider>>,
    /// Whether shell gates may execute (process-env opt-in).
    pub shell_enabled: bool,
}

/// Evaluate a single gate against a value.
pub async fn evaluate_gate(spec: &GateSpec, value: &Value, ctx: &GateContext) -> GateResult {
    let start = Instant::now();
    let label = spec.label();

    match spec {
        GateSpec::JsonSchema { schema } => {
            let violations = validate_value(schema, value);
            let duration = elapsed_ms(start);
            if violations.is_empty() {
                GateResult::pass(label, duration)
            } else {
                let reason = violations
                    .iter()
                    .map(|v| format!("{}: {}", v.path, v.message))
                    .collect::<Vec<_>>()
                    .join("; ");
                let mut result = GateResult::fail(label, reason, duration);
                result.details = serde_json::to_value(&violations).ok();
                result
            }
        }
        GateSpec::Expression { expr } => {
            let duration = elapsed_ms(start);
            match expr::evaluate_bool(expr, value) {
                Ok(true) => GateResult::pass(label, duration),
                Ok(false) => GateResult::fail(
                    label,
                    format!("expression not satisfied: {expr}"),
                    duration,
                ),
                Err(e) => GateResult::fail(label, e.to_string(), duration),
            }
        }
        GateSpec::WordCount { min, max } => {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let words = text.split_whitespace().count();
            let duration = elapsed_ms(start);
            if let Some(min) = min {
                if words < *min {
                    return GateResult::fail(
                        label,
                        format!("word count {words} below minimum {min}"),
                        duration,
                    );
                }
            }
            if let Some(max) = max {
                if words > *max {
                    return GateResult::fail(
                        label,
                        format!("word count {words} above maximum {max}"),
                        duration,
                    );
                }
            }
            GateResult::pass(label, duration)
        }
        GateSpec::LlmReview {
            criteria,
            threshold,
        } => {
            let Some(provider) = ctx.llm.as_ref() else {
                return GateResult::fail(
                    label,
                    "no llm review provider configured",
                    elapsed_ms(start),
                );
            };
            match provider.review(value, criteria).await {
                Ok(outcome) => {
                    let duration = elapsed_ms(start);
                    let details = serde_json::to_value(&outcome).ok();
                    if outcome.score >= *threshold {
                        let mut result = GateResult::pass(label, duration);
                        result.details = details;
                        result
                    } else {
                        let mut result = GateResult::fail(
                            label,
                            format!(
                                "review score {:.2} below threshold {threshold:.2}",
                                outcome.score
                            ),
                            duration,
                        );
                        result.details = details;
                        result
                    }
                }
                Err(e) => GateResult::fail(
                    label,
                    format!("review provider failed: {e:#}"),
                    elapsed_ms(start),
                ),
            }
        }
        GateSpec::Shell {
            command,
            expected_exit_code,
            timeout_ms,
        } => {
            if !ctx.shell_enabled {
                let mut result = GateResult::fail(
                    label,
                    format!("shell gates are disabled (set {})", shell::SHELL_GATES_ENV),
                    elapsed_ms(start),
                );
                result.audit = Some(shell::blocked_audit());
                return result;
            }
            match shell::run_shell_gate(
                command,
                *expected_exit_code,
                Duration::from_millis(*timeout_ms),
            )
            .await
            {
                Ok(outcome) => {
                    let mut result = if outcome.passed {
                        GateResult::pass(label, outcome.duration_ms)
                    } else {
                        GateResult::fail(
                            label,
                            format!(
                                "exit code {:?}, expected {expected_exit_code}: {}",
                                outcome.exit_code, outcome.stderr_snippet
                            ),
                            outcome.duration_ms,
                        )
                    };
                    result.audit = Some(outcome.audit);
                    result
                }
                Err(e) => {
                    let mut result = GateResult::fail(
                        label,
                        format!("failed to execute: {e:#}"),
                        elapsed_ms(start),
                    );
                    result.audit = Some(json!({
                        "status": "error",
                        "gate_type": "shell",
                        "command": command,
                    }));
                    result
                }
            }
        }
    }
}

/// Evaluate gates in order, recording every result (no short-circuit: each
/// gate's audit is wanted even when an earlier one failed).
pub async fn evaluate_gates(
    specs: &[GateSpec],
    value: &Value,
    ctx: &GateContext,
) -> Vec<GateResult> {
    let mut results = Vec::with_capacity(specs.len());
    for spec in specs {
        results.push(evaluate_gate(spec, value, ctx).await);
    }
    results
}

/// Compose retry feedback text from failing gate results: one line per
/// failure naming the gate and its reason/path details.
pub fn compose_feedback(results: &[GateResult]) -> String {
    let mut lines = Vec::new();
    for result in results.iter().filter(|r| !r.passed) {
        match &result.reason {
            Some(reason) => lines.push(format!("- {} failed: {reason}", result.gate)),
            None => lines.push(format!("- {} failed", result.gate)),
        }
    }
    if lines.is_empty() {
        String::new()
    } else {
        format!(
            "The previous output did not satisfy these checks:\n{}",
            lines.join("\n")
        )
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
