//! The `gated` retry harness: call a producer repeatedly until every gate
//! passes, feeding structured failure feedback back into each retry.
//!
//! This is the linear cousin of the block executor's dispatch loop, used by
//! gate checks and any embedder that needs produce -> validate -> feedback
//! without a full DAG.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use crate::gate::{GateContext, GateResult, GateSpec, compose_feedback, evaluate_gates};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// How raw producer output becomes the value the gates see.
#[derive(Clone, Default)]
pub enum ExtractMode {
    /// Strings that look like JSON are parsed; everything else passes
    /// through.
    #[default]
    Auto,
    /// Force JSON extraction: fenced code block first, then the first
    /// braced/bracketed substring.
    Json,
    /// Keep the raw string.
    Text,
    /// Delegate to a caller-supplied extractor.
    Custom(Arc<dyn Fn(&Value) -> anyhow::Result<Value> + Send + Sync>),
}

impl std::fmt::Debug for ExtractMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => f.write_str("Auto"),
            Self::Json => f.write_str("Json"),
            Self::Text => f.write_str("Text"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Harness options.
#[derive(Debug, Clone)]
pub struct GatedOptions {
    /// Maximum attempts (default 3).
    pub max: u32,
    /// Whether failure feedback is passed to the next attempt.
    pub feedback: bool,
    pub extract: ExtractMode,
}

impl Default for GatedOptions {
    fn default() -> Self {
        Self {
            max: 3,
            feedback: true,
            extract: ExtractMode::Auto,
        }
    }
}

/// Inputs handed to the producer on each attempt.
#[derive(Debug, Clone, Default)]
pub struct AttemptCtx {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Feedback composed from the previous attempt's failing gates.
    pub feedback: Option<String>,
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Everything recorded about one attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub gates: Vec<GateResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A successful harness run.
#[derive(Debug, Clone, Serialize)]
pub struct GatedOutcome {
    pub data: Value,
    pub attempts: u32,
    /// Gate results of the passing attempt.
    pub gates: Vec<GateResult>,
    pub history: Vec<AttemptRecord>,
    pub duration_ms: u64,
}

/// Exhaustion after `max` failed attempts, carrying the full history.
#[derive(Debug, thiserror::Error)]
#[error("gates not satisfied after {attempts} attempts")]
pub struct GateExhaustion {
    pub attempts: u32,
    pub history: Vec<AttemptRecord>,
    pub last_data: Option<Value>,
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Pull JSON out of producer text: fenced code block first, then the first
/// balanced `{...}` / `[...]` substring.
pub fn extract_json(text: &str) -> Option<Value> {
    if let Some(block) = fenced_block(text) {
        if let Ok(value) = serde_json::from_str(block.trim()) {
            return Some(value);
        }
    }
    for open in ['{', '['] {
        let close = if open == '{' { '}' } else { ']' };
        if let (Some(start), Some(end)) = (text.find(open), text.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str(&text[start..=end]) {
                    return Some(value);
                }
            }
        }
    }
    None
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip an optional language tag on the fence line.
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

fn apply_extract(mode: &ExtractMode, raw: &Value) -> anyhow::Result<Value> {
    match mode {
        ExtractMode::Text => Ok(raw.clone()),
        ExtractMode::Json => match raw {
            Value::String(s) => extract_json(s)
                .ok_or_else(|| anyhow::anyhow!("no JSON found in producer output")),
            other => Ok(other.clone()),
        },
        ExtractMode::Auto => match raw {
            Value::String(s) => {
                let trimmed = s.trim_start();
                if trimmed.starts_with('{') || trimmed.starts_with('[') {
                    Ok(extract_json(s).unwrap_or_else(|| raw.clone()))
                } else {
                    Ok(raw.clone())
                }
            }
            other => Ok(other.clone()),
        },
        ExtractMode::Custom(f) => f(raw),
    }
}

// ---------------------------------------------------------------------------
// The harness
// ---------------------------------------------------------------------------

/// Run the produce -> extract -> gate loop.
///
/// Gates run in order on every attempt; an empty gate list passes on the
/// first attempt. After `options.max` failures the error carries the full
/// attempt history (exactly one record per attempt).
pub async fn gated<F, Fut>(
    mut producer: F,
    gates: &[GateSpec],
    gate_ctx: &GateContext,
    options: GatedOptions,
    mut on_attempt: Option<&mut (dyn FnMut(&AttemptRecord) + Send)>,
) -> Result<GatedOutcome, GateExhaustion>
where
    F: FnMut(AttemptCtx) -> Fut,
    Fut: Future<Output = anyhow::Result<Value>>,
{
    let start = Instant::now();
    let max = options.max.max(1);
    let mut history: Vec<AttemptRecord> = Vec::new();
    let mut feedback: Option<String> = None;
    let mut last_data: Option<Value> = None;

    for attempt in 1..=max {
        let attempt_start = Instant::now();
        let ctx = AttemptCtx {
            attempt,
            feedback: if options.feedback {
                feedback.clone()
            } else {
                None
            },
        };

        let produced = producer(ctx).await;
        let raw = match produced {
            Ok(raw) => raw,
            Err(e) => {
                let record = AttemptRecord {
                    attempt,
                    data: None,
                    gates: Vec::new(),
                    feedback: feedback.clone(),
                    duration_ms: elapsed_ms(attempt_start),
                    error: Some(format!("producer failed: {e:#}")),
                };
                if let Some(cb) = on_attempt.as_mut() {
                    cb(&record);
                }
                history.push(record);
                continue;
            }
        };

        let data = match apply_extract(&options.extract, &raw) {
            Ok(data) => data,
            Err(e) => {
                let record = AttemptRecord {
                    attempt,
                    data: Some(raw),
                    gates: Vec::new(),
                    feedback: feedback.clone(),
                    duration_ms: elapsed_ms(attempt_start),
                    error: Some(format!("extraction failed: {e:#}")),
                };
                if let Some(cb) = on_attempt.as_mut() {
                    cb(&record);
                }
                history.push(record);
                continue;
            }
        };

        let results = evaluate_gates(gates, &data, gate_ctx).await;
        let all_passed = results.iter().all(|r| r.passed);
        let next_feedback = if all_passed {
            None
        } else {
            Some(compose_feedback(&results))
        };

        let record = AttemptRecord {
            attempt,
            data: Some(data.clone()),
            gates: results.clone(),
            feedback: feedback.clone(),
            duration_ms: elapsed_ms(attempt_start),
            error: None,
        };
        if let Some(cb) = on_attempt.as_mut() {
            cb(&record);
        }
        history.push(record);
        last_data = Some(data.clone());

        if all_passed {
            return Ok(GatedOutcome {
                data,
                attempts: attempt,
                gates: results,
                history,
                duration_ms: elapsed_ms(start),
            });
        }
        feedback = next_feedback;
    }

    Err(GateExhaustion {
        attempts: max,
        history,
        last_data,
    })
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn count_gate(expr: &str) -> Vec<GateSpec> {
        vec![GateSpec::Expression { expr: expr.into() }]
    }

    #[tokio::test]
    async fn empty_gate_list_passes_first_attempt() {
        let ctx = GateContext::default();
        let outcome = gated(
            |_| async { Ok(json!({"x": 1})) },
            &[],
            &ctx,
            GatedOptions::default(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.gates.is_empty());
    }

    #[tokio::test]
    async fn retry_then_succeed() {
        let ctx = GateContext::default();
        let calls = AtomicU32::new(0);
        let outcome = gated(
            |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(json!({"count": n})) }
            },
            &count_gate("count >= 2"),
            &ctx,
            GatedOptions {
                max: 3,
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.data, json!({"count": 2}));
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.history.len(), 2);
        assert!(!outcome.history[0].gates[0].passed);
        assert!(outcome.history[1].gates[0].passed);
    }

    #[tokio::test]
    async fn feedback_reaches_the_next_attempt() {
        let ctx = GateContext::default();
        let seen = std::sync::Mutex::new(Vec::new());
        let _ = gated(
            |attempt_ctx: AttemptCtx| {
                seen.lock().unwrap().push(attempt_ctx.feedback.clone());
                async { Ok(json!({"price": 0})) }
            },
            &count_gate("price > 100"),
            &ctx,
            GatedOptions {
                max: 2,
                ..Default::default()
            },
            None,
        )
        .await;

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_none());
        assert!(seen[1].as_deref().unwrap().contains("price > 100"));
    }

    #[tokio::test]
    async fn feedback_disabled_stays_none() {
        let ctx = GateContext::default();
        let seen = std::sync::Mutex::new(Vec::new());
        let _ = gated(
            |attempt_ctx: AttemptCtx| {
                seen.lock().unwrap().push(attempt_ctx.feedback.clone());
                async { Ok(json!({"price": 0})) }
            },
            &count_gate("price > 100"),
            &ctx,
            GatedOptions {
                max: 2,
                feedback: false,
                ..Default::default()
            },
            None,
        )
        .await;

        assert!(seen.into_inner().unwrap().iter().all(Option::is_none));
    }

    #[tokio::test]
    async fn exhaustion_carries_full_history() {
        let ctx = GateContext::default();
        let err = gated(
            |_| async { Ok(json!({"count": 0})) },
            &count_gate("count >= 1"),
            &ctx,
            GatedOptions {
                max: 3,
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 3);
        assert_eq!(err.history.len(), 3);
        assert_eq!(err.last_data, Some(json!({"count": 0})));
        // Exactly one gate evaluation per gate per attempt.
        assert!(err.history.iter().all(|r| r.gates.len() == 1));
    }

    #[tokio::test]
    async fn producer_errors_count_as_attempts() {
        let ctx = GateContext::default();
        let calls = AtomicU32::new(0);
        let outcome = gated(
            |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        anyhow::bail!("flaky")
                    } else {
                        Ok(json!({"count": 5}))
                    }
                }
            },
            &count_gate("count >= 1"),
            &ctx,
            GatedOptions::default(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.attempts, 2);
        assert!(outcome.history[0].error.as_deref().unwrap().contains("flaky"));
    }

    #[tokio::test]
    async fn on_attempt_callback_fires_per_attempt() {
        let ctx = GateContext::default();
        let mut attempts_seen = Vec::new();
        let mut callback = |record: &AttemptRecord| {
            attempts_seen.push(record.attempt);
        };
        let _ = gated(
            |_| async { Ok(json!({"count": 0})) },
            &count_gate("count >= 1"),
            &ctx,
            GatedOptions {
                max: 2,
                ..Default::default()
            },
            Some(&mut callback),
        )
        .await;
        assert_eq!(attempts_seen, vec![1, 2]);
    }

    #[test]
    fn extract_json_prefers_fenced_blocks() {
        let text = "Sure, here you go:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract_json(text), Some(json!({"a": 1})));
    }

    #[test]
    fn extract_json_falls_back_to_braces() {
        let text = "prefix {\"a\": [1, 2]} suffix";
        assert_eq!(extract_json(text), Some(json!({"a": [1, 2]})));
        assert_eq!(extract_json("[1, 2, 3]"), Some(json!([1, 2, 3])));
        assert_eq!(extract_json("no json here"), None);
    }

    #[tokio::test]
    async fn text_mode_keeps_raw_string() {
        let ctx = GateContext::default();
        let outcome = gated(
            |_| async { Ok(json!("{\"not\": \"parsed\"}")) },
            &[],
            &ctx,
            GatedOptions {
                extract: ExtractMode::Text,
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
        assert!(outcome.data.is_string());
    }

    #[tokio::test]
    async fn auto_mode_parses_json_looking_strings() {
        let ctx = GateContext::default();
        let outcome = gated(
            |_| async { Ok(json!("{\"count\": 3}")) },
            &count_gate("count >= 3"),
            &ctx,
            GatedOptions::default(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(outcome.data, json!({"count": 3}));
    }

    #[tokio::test]
    async fn custom_extractor() {
        let ctx = GateContext::default();
        let outcome = gated(
            |_| async { Ok(json!({"wrapped": {"count": 9}})) },
            &count_gate("count >= 9"),
            &ctx,
            GatedOptions {
                extract: ExtractMode::Custom(Arc::new(|raw| {
                    raw.get("wrapped")
                        .cloned()
                        .ok_or_else(|| anyhow::anyhow!("missing wrapper"))
                })),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
        assert_eq!(outcome.data, json!({"count": 9}));
    }
}
