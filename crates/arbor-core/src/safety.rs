//! Global safety caps and admission limits.
//!
//! Every cap has a compiled default and an `ARBOR_*` environment override,
//! read once at engine construction. Per-block retry counts and timeouts
//! are clamped against these caps at admission.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use crate::gate::shell::SHELL_GATES_ENV;
use crate::graph::DagDef;

/// Global limits enforced by the engine.
#[derive(Debug, Clone)]
pub struct SafetyLimits {
    pub max_concurrent_runs: usize,
    pub max_run_duration_ms: u64,
    pub max_block_duration_ms: u64,
    /// Clamp on per-block `retry.max_attempts`.
    pub max_retries_cap: u32,
    pub stall_timeout_ms: u64,
    pub orphan_timeout_ms: u64,
    pub queue_lease_ms: u64,
    pub max_tokens_per_run: Option<u64>,
    pub max_tokens_per_block: Option<u64>,
    pub max_request_bytes: usize,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max: u32,
    pub api_key: Option<String>,
    pub shell_gates_enabled: bool,
    /// Worker-pool width per run.
    pub max_parallel_blocks: usize,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 2,
            max_run_duration_ms: 30 * 60 * 1000,
            max_block_duration_ms: 10 * 60 * 1000,
            max_retries_cap: 2,
            stall_timeout_ms: 5 * 60 * 1000,
            orphan_timeout_ms: 2 * 60 * 1000,
            queue_lease_ms: 30 * 1000,
            max_tokens_per_run: None,
            max_tokens_per_block: None,
            max_request_bytes: 512 * 1024,
            rate_limit_window_ms: 60 * 1000,
            rate_limit_max: 120,
            api_key: None,
            shell_gates_enabled: false,
            max_parallel_blocks: 4,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "ignoring unparsable env override");
                None
            }
        },
        Err(_) => None,
    }
}

impl SafetyLimits {
    /// Defaults with `ARBOR_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut limits = Self::default();
        if let Some(v) = env_parse("ARBOR_MAX_CONCURRENT_RUNS") {
            limits.max_concurrent_runs = v;
        }
        if let Some(v) = env_parse("ARBOR_MAX_RUN_DURATION_MS") {
            limits.max_run_duration_ms = v;
        }
        if let Some(v) = env_parse("ARBOR_MAX_BLOCK_DURATION_MS") {
            limits.max_block_duration_ms = v;
        }
        if let Some(v) = env_parse("ARBOR_MAX_RETRIES_CAP") {
            limits.max_retries_cap = v;
        }
        if let Some(v) = env_parse("ARBOR_STALL_TIMEOUT_MS") {
            limits.stall_timeout_ms = v;
        }
        if let Some(v) = env_parse("ARBOR_ORPHAN_TIMEOUT_MS") {
            limits.orphan_timeout_ms = v;
        }
        if let Some(v) = env_parse("ARBOR_QUEUE_LEASE_MS") {
            limits.queue_lease_ms = v;
        }
        limits.max_tokens_per_run = env_parse("ARBOR_MAX_TOKENS_PER_RUN");
        limits.max_tokens_per_block = env_parse("ARBOR_MAX_TOKENS_PER_BLOCK");
        if let Some(v) = env_parse("ARBOR_MAX_REQUEST_BYTES") {
            limits.max_request_bytes = v;
        }
        if let Some(v) = env_parse("ARBOR_RATE_LIMIT_WINDOW_MS") {
            limits.rate_limit_window_ms = v;
        }
        if let Some(v) = env_parse("ARBOR_RATE_LIMIT_MAX") {
            limits.rate_limit_max = v;
        }
        if let Ok(key) = std::env::var("ARBOR_API_KEY") {
            if !key.is_empty() {
                limits.api_key = Some(key);
            }
        }
        limits.shell_gates_enabled = std::env::var(SHELL_GATES_ENV).is_ok();
        if let Some(v) = env_parse("ARBOR_MAX_PARALLEL_BLOCKS") {
            limits.max_parallel_blocks = v;
        }
        limits
    }

    /// Clamp every block's retry count and timeout to the caps, in place.
    pub fn clamp_dag(&self, dag: &mut DagDef) {
        for block in &mut dag.blocks {
            if block.retry.max_attempts > self.max_retries_cap {
                tracing::debug!(
                    block_id = %block.id,
                    requested = block.retry.max_attempts,
                    cap = self.max_retries_cap,
                    "clamping block retries"
                );
                block.retry.max_attempts = self.max_retries_cap;
            }
            block.timeout_ms = Some(
                block
                    .timeout_ms
                    .unwrap_or(self.max_block_duration_ms)
                    .min(self.max_block_duration_ms),
            );
        }
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn orphan_timeout(&self) -> Duration {
        Duration::from_millis(self.orphan_timeout_ms)
    }

    pub fn max_run_duration(&self) -> Duration {
        Duration::from_millis(self.max_run_duration_ms)
    }

    /// The payload for `GET /api/dag/safety`.
    pub fn to_json(&self) -> Value {
        json!({
            "max_concurrent_runs": self.max_concurrent_runs,
            "max_run_duration_ms": self.max_run_duration_ms,
            "max_block_duration_ms": self.max_block_duration_ms,
            "max_retries_cap": self.max_retries_cap,
            "stall_timeout_ms": self.stall_timeout_ms,
            "orphan_timeout_ms": self.orphan_timeout_ms,
            "queue_lease_ms": self.queue_lease_ms,
            "max_tokens_per_run": self.max_tokens_per_run,
            "max_tokens_per_block": self.max_tokens_per_block,
            "max_request_bytes": self.max_request_bytes,
            "rate_limit_window_ms": self.rate_limit_window_ms,
            "rate_limit_max": self.rate_limit_max,
            "api_key_required": self.api_key.is_some(),
            "shell_gates_enabled": self.shell_gates_enabled,
            "max_parallel_blocks": self.max_parallel_blocks,
        })
    }
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Fixed-window per-client rate limiter.
pub struct RateLimiter {
    window: Duration,
    max: u32,
    state: Mutex<HashMap<String, (Instant, u32)>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max: u32) -> Self {
        Self {
            window,
            max,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_limits(limits: &SafetyLimits) -> Self {
        Self::new(
            Duration::from_millis(limits.rate_limit_window_ms),
            limits.rate_limit_max,
        )
    }

    /// Record a request for `key`; false when the window budget is spent.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().expect("rate limiter lock poisoned");

        // Opportunistic prune so the map tracks only live windows.
        if state.len() > 1024 {
            let window = self.window;
            state.retain(|_, (start, _)| now.duration_since(*start) < window);
        }

        let entry = state.entry(key.to_owned()).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        if entry.1 >= self.max {
            return false;
        }
        entry.1 += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::examples::example_dag;

    #[test]
    fn defaults_match_documented_caps() {
        let limits = SafetyLimits::default();
        assert_eq!(limits.max_concurrent_runs, 2);
        assert_eq!(limits.max_retries_cap, 2);
        assert_eq!(limits.max_request_bytes, 512 * 1024);
        assert_eq!(limits.rate_limit_max, 120);
        assert!(!limits.shell_gates_enabled);
    }

    #[test]
    fn clamp_dag_bounds_retries_and_timeouts() {
        let limits = SafetyLimits::default();
        let mut dag = example_dag("two-step").unwrap();
        dag.block_mut("draft").unwrap().retry.max_attempts = 99;
        dag.block_mut("draft").unwrap().timeout_ms = Some(u64::MAX);
        limits.clamp_dag(&mut dag);

        let draft = dag.block("draft").unwrap();
        assert_eq!(draft.retry.max_attempts, limits.max_retries_cap);
        assert_eq!(draft.timeout_ms, Some(limits.max_block_duration_ms));
        // A block with no timeout gets the cap as its default.
        assert_eq!(
            dag.block("outline").unwrap().timeout_ms,
            Some(limits.max_block_duration_ms)
        );
    }

    #[test]
    fn rate_limiter_enforces_window_budget() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 3);
        assert!(limiter.check("client"));
        assert!(limiter.check("client"));
        assert!(limiter.check("client"));
        assert!(!limiter.check("client"));
        // Other clients have their own budget.
        assert!(limiter.check("other"));
    }

    #[test]
    fn rate_limiter_window_resets() {
        let limiter = RateLimiter::new(Duration::from_millis(10), 1);
        assert!(limiter.check("client"));
        assert!(!limiter.check("client"));
        std::thread::sleep(Duration::from_millis(15));
        assert!(limiter.check("client"));
    }

    #[test]
    fn safety_json_shape() {
        let limits = SafetyLimits::default();
        let value = limits.to_json();
        assert_eq!(value["max_concurrent_runs"], 2);
        assert_eq!(value["api_key_required"], false);
    }
}
