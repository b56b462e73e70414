//! Shared test utilities for arbor integration tests.
//!
//! Provides throwaway SQLite databases with migrations applied, scripted
//! provider adapters, a fixed-score review provider, and small DAG
//! builders used across the crates' test suites.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use arbor_core::adapter::{DispatchOutcome, DispatchRequest, ProviderAdapter};
use arbor_core::gate::llm::{CriterionResult, LlmReviewProvider, ReviewOutcome};
use arbor_db::DbConfig;
use arbor_db::pool;

/// Create a temporary file-backed database with migrations applied.
///
/// Returns `(pool, guard)`; dropping the guard deletes the directory, so
/// keep it alive for the duration of the test.
pub async fn create_test_db() -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let db_path = dir.path().join("arbor-test.db");
    let config = DbConfig::new(format!("sqlite://{}", db_path.display()));

    let pool = pool::create_pool(&config)
        .await
        .expect("failed to open test database");
    pool::run_migrations(&pool, pool::default_migrations_path())
        .await
        .expect("failed to migrate test database");

    (pool, dir)
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

/// One step of a scripted adapter's behavior.
#[derive(Debug, Clone)]
pub enum Script {
    /// Succeed with this output string.
    Ok(String),
    /// Report `success: false` with this error.
    Fail(String),
    /// Return an adapter-level error.
    Err(String),
    /// Sleep this long (observing cancellation), then succeed.
    Hang(Duration),
}

/// A provider adapter driven by a queue of scripted outcomes. Once the
/// script is exhausted it keeps succeeding with the last `Ok` output (or a
/// generic one). Every request is recorded for assertions.
pub struct ScriptedAdapter {
    name: String,
    script: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<DispatchRequest>>,
}

impl ScriptedAdapter {
    pub fn new(name: impl Into<String>, script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// An adapter that always succeeds with the given output.
    pub fn always_ok(output: impl Into<String>) -> Arc<Self> {
        Self::new("scripted", vec![Script::Ok(output.into())])
    }

    /// Requests seen so far.
    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(
        &self,
        request: &DispatchRequest,
        cancel: CancellationToken,
    ) -> Result<DispatchOutcome> {
        self.requests.lock().unwrap().push(request.clone());

        let step = {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };

        match step {
            Some(Script::Ok(output)) => Ok(DispatchOutcome::ok(output)),
            Some(Script::Fail(error)) => Ok(DispatchOutcome::err(error)),
            Some(Script::Err(error)) => anyhow::bail!("{error}"),
            Some(Script::Hang(duration)) => {
                tokio::select! {
                    _ = cancel.cancelled() => Ok(DispatchOutcome::err("cancelled")),
                    _ = tokio::time::sleep(duration) => {
                        Ok(DispatchOutcome::ok("{\"hung\": false}"))
                    }
                }
            }
            None => Ok(DispatchOutcome::ok("{\"done\": true}")),
        }
    }
}

/// A reviewer that always returns the same score.
pub struct FixedReviewer {
    pub score: f64,
}

#[async_trait]
impl LlmReviewProvider for FixedReviewer {
    async fn review(&self, _output: &Value, criteria: &[String]) -> Result<ReviewOutcome> {
        Ok(ReviewOutcome {
            passed: self.score >= 0.8,
            score: self.score,
            criteria_results: criteria
                .iter()
                .map(|criterion| CriterionResult {
                    criterion: criterion.clone(),
                    passed: self.score >= 0.8,
                    score: Some(self.score),
                    notes: None,
                })
                .collect(),
            cost: Some(0.0),
        })
    }
}

// ---------------------------------------------------------------------------
// DAG builders
// ---------------------------------------------------------------------------

/// A minimal linear DAG `a -> b` as a JSON start-request payload. Block `a`
/// reads `prompt` from the context; `b` consumes `a.result`.
pub fn linear_dag_json(name: &str) -> Value {
    json!({
        "name": name,
        "blocks": [
            {
                "id": "a",
                "inputs": {"prompt": {"type": "string"}},
                "outputs": {"result": {"type": "json"}}
            },
            {
                "id": "b",
                "inputs": {"result": {"type": "json"}},
                "outputs": {"final": {"type": "json"}}
            }
        ],
        "edges": [
            {"from_block": "a", "from_port": "result", "to_block": "b", "to_port": "result"}
        ]
    })
}

/// A single-block DAG with the given extra block fields merged in.
pub fn one_block_dag_json(name: &str, block_extra: Value) -> Value {
    let mut block = json!({
        "id": "solo",
        "inputs": {"prompt": {"type": "string"}},
        "outputs": {"result": {"type": "json"}}
    });
    if let (Some(base), Some(extra)) = (block.as_object_mut(), block_extra.as_object()) {
        for (key, value) in extra {
            base.insert(key.clone(), value.clone());
        }
    }
    json!({
        "name": name,
        "blocks": [block],
        "edges": []
    })
}
