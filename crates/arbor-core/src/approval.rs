//! Approval requests, decisions, and iteration-run construction.
//!
//! An approval request lives in two places at once: on the run context
//! (under [`crate::run::CTX_APPROVAL_REQUEST`]) and mirrored durably in
//! `dag_approvals`. It ends at the first decision. Rejections may spawn a
//! fresh iteration run carrying the shared memory forward.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use arbor_db::models::ApprovalStatus;

use crate::run::{
    CTX_ITERATION_PARENT, CTX_ITERATION_ROOT, CTX_LATEST_FEEDBACK, Run, is_reserved_key,
};

/// Maximum bytes of context preview carried on a request.
const CONTEXT_PREVIEW_MAX: usize = 4096;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// How a rejected run restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    #[default]
    Refine,
    FromScratch,
}

/// A pending human decision point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub token: String,
    pub run_id: String,
    pub block_id: String,
    pub status: ApprovalStatus,
    pub prompt: String,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default)]
    pub restart_mode: RestartMode,
    /// Truncated public-context snapshot shown to the approver.
    pub context_preview: Value,
}

impl ApprovalRequest {
    /// Build a new pending request for a block, previewing the run's public
    /// context.
    pub fn new(run: &Run, block_id: &str, prompt: &str) -> Self {
        Self {
            token: new_token(),
            run_id: run.id.clone(),
            block_id: block_id.to_owned(),
            status: ApprovalStatus::Pending,
            prompt: prompt.to_owned(),
            requested_at: Utc::now(),
            decided_at: None,
            notes: None,
            feedback: None,
            restart_mode: RestartMode::default(),
            context_preview: context_preview(&run.context),
        }
    }
}

/// Generate an opaque approval token.
pub fn new_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn context_preview(context: &Map<String, Value>) -> Value {
    let mut preview = Map::new();
    let mut budget = CONTEXT_PREVIEW_MAX;
    for (key, value) in context {
        if is_reserved_key(key) {
            continue;
        }
        let rendered = value.to_string();
        if rendered.len() > budget {
            preview.insert(key.clone(), json!("<truncated>"));
            continue;
        }
        budget -= rendered.len();
        preview.insert(key.clone(), value.clone());
    }
    Value::Object(preview)
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// The decision verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

fn default_iterate() -> bool {
    true
}

/// A decision on a pending approval, as posted by the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default)]
    pub restart_mode: RestartMode,
    /// Whether a rejection spawns a fresh iteration (default) or fails the
    /// run outright.
    #[serde(default = "default_iterate")]
    pub iterate: bool,
}

/// What actually happened after a decision was applied, reported back to
/// the HTTP caller.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionApplied {
    pub decision: Decision,
    pub run_status: arbor_db::models::RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterated_run_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

/// Outcome of preparing an iteration from a rejected run.
#[derive(Debug)]
pub enum IterationPlan {
    /// Start a child run with this context.
    Spawn {
        context: Map<String, Value>,
        cycle: u32,
    },
    /// The cycle budget is exhausted; fail the parent instead.
    MaxCyclesReached { cycle: u32, max_cycles: u32 },
}

/// Build the child-run context for a reject-iterate decision.
///
/// Carries over the parent's public context and shared memory with the
/// cycle incremented, links parent/root ids, and restores the original
/// intent as `prompt` for `from_scratch` restarts. The decision's feedback
/// is NOT appended here: [`record_decision`] already wrote it into the
/// parent's `feedback_history`, and this function snapshots that memory.
pub fn plan_iteration(parent: &Run, decision: &ApprovalDecision) -> IterationPlan {
    let mut memory = parent.shared_memory().unwrap_or_default();
    memory.cycle += 1;

    if memory.cycle > memory.max_cycles {
        return IterationPlan::MaxCyclesReached {
            cycle: memory.cycle,
            max_cycles: memory.max_cycles,
        };
    }

    let mut context: Map<String, Value> = parent
        .context
        .iter()
        .filter(|(key, _)| !is_reserved_key(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    if decision.restart_mode == RestartMode::FromScratch {
        if let Some(intent) = &memory.original_intent {
            context.insert("prompt".to_owned(), json!(intent));
        }
    }

    let root = parent
        .context
        .get(CTX_ITERATION_ROOT)
        .and_then(Value::as_str)
        .unwrap_or(&parent.id)
        .to_owned();

    context.insert(CTX_ITERATION_PARENT.to_owned(), json!(parent.id));
    context.insert(CTX_ITERATION_ROOT.to_owned(), json!(root));
    if let Some(feedback) = &decision.feedback {
        context.insert(CTX_LATEST_FEEDBACK.to_owned(), json!(feedback));
    }
    if let Ok(value) = serde_json::to_value(&memory) {
        context.insert(crate::run::CTX_SHARED_MEMORY.to_owned(), value);
    }

    IterationPlan::Spawn {
        context,
        cycle: memory.cycle,
    }
}

/// Record a decision into the parent run's shared memory.
pub fn record_decision(run: &mut Run, block_id: &str, decision: &ApprovalDecision) {
    let mut memory = run.shared_memory().unwrap_or_default();
    memory.decisions.push(json!({
        "block_id": block_id,
        "decision": decision.decision,
        "notes": decision.notes,
        "feedback": decision.feedback,
        "decided_at": Utc::now(),
    }));
    if let Some(feedback) = &decision.feedback {
        if decision.decision == Decision::Reject {
            memory.feedback_history.push(feedback.clone());
            run.context
                .insert(CTX_LATEST_FEEDBACK.to_owned(), json!(feedback));
        }
    }
    run.set_shared_memory(&memory);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::examples::example_dag;
    use crate::run::{CTX_SHARED_MEMORY, SharedMemory};

    fn run_with_context(pairs: &[(&str, Value)]) -> Run {
        let dag = example_dag("reviewed-draft").unwrap();
        let mut context = Map::new();
        for (key, value) in pairs {
            context.insert((*key).to_owned(), value.clone());
        }
        Run::new("parent".into(), &dag, context)
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(new_token(), new_token());
        assert_eq!(new_token().len(), 32);
    }

    #[test]
    fn request_preview_excludes_reserved_keys() {
        let run = run_with_context(&[("prompt", json!("hello"))]);
        let request = ApprovalRequest::new(&run, "draft", "Review this");
        assert_eq!(request.context_preview["prompt"], "hello");
        assert!(request.context_preview.get(CTX_SHARED_MEMORY).is_none());
    }

    #[test]
    fn plan_iteration_increments_cycle_and_links_lineage() {
        let mut run = run_with_context(&[("prompt", json!("v1"))]);
        let decision = ApprovalDecision {
            decision: Decision::Reject,
            notes: None,
            feedback: Some("tighter".into()),
            restart_mode: RestartMode::Refine,
            iterate: true,
        };
        // The executor records the decision on the parent first; the plan
        // then snapshots that memory.
        record_decision(&mut run, "draft", &decision);
        match plan_iteration(&run, &decision) {
            IterationPlan::Spawn { context, cycle } => {
                assert_eq!(cycle, 1);
                assert_eq!(context[CTX_ITERATION_PARENT], "parent");
                assert_eq!(context[CTX_ITERATION_ROOT], "parent");
                assert_eq!(context[CTX_LATEST_FEEDBACK], "tighter");
                let memory: SharedMemory =
                    serde_json::from_value(context[CTX_SHARED_MEMORY].clone()).unwrap();
                assert_eq!(memory.cycle, 1);
                // Exactly one entry: recording and planning must not both
                // append the same feedback.
                assert_eq!(memory.feedback_history, vec!["tighter"]);
                // Refine keeps the current prompt.
                assert_eq!(context["prompt"], "v1");
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn plan_iteration_does_not_append_feedback_itself() {
        // Called without record_decision, the plan carries the memory
        // through untouched apart from the cycle bump.
        let run = run_with_context(&[]);
        let decision = ApprovalDecision {
            decision: Decision::Reject,
            notes: None,
            feedback: Some("tighter".into()),
            restart_mode: RestartMode::Refine,
            iterate: true,
        };
        match plan_iteration(&run, &decision) {
            IterationPlan::Spawn { context, .. } => {
                let memory: SharedMemory =
                    serde_json::from_value(context[CTX_SHARED_MEMORY].clone()).unwrap();
                assert!(memory.feedback_history.is_empty());
                // The latest-feedback pointer is still carried for the child.
                assert_eq!(context[CTX_LATEST_FEEDBACK], "tighter");
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn plan_iteration_from_scratch_restores_intent() {
        let mut run = run_with_context(&[("prompt", json!("v3-mangled"))]);
        let mut memory = run.shared_memory().unwrap();
        memory.original_intent = Some("the original ask".into());
        run.set_shared_memory(&memory);

        let decision = ApprovalDecision {
            decision: Decision::Reject,
            notes: None,
            feedback: None,
            restart_mode: RestartMode::FromScratch,
            iterate: true,
        };
        match plan_iteration(&run, &decision) {
            IterationPlan::Spawn { context, .. } => {
                assert_eq!(context["prompt"], "the original ask");
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn plan_iteration_stops_at_max_cycles() {
        let mut run = run_with_context(&[]);
        let mut memory = run.shared_memory().unwrap();
        memory.cycle = 5;
        memory.max_cycles = 5;
        run.set_shared_memory(&memory);

        let decision = ApprovalDecision {
            decision: Decision::Reject,
            notes: None,
            feedback: None,
            restart_mode: RestartMode::Refine,
            iterate: true,
        };
        match plan_iteration(&run, &decision) {
            IterationPlan::MaxCyclesReached { cycle, max_cycles } => {
                assert_eq!(cycle, 6);
                assert_eq!(max_cycles, 5);
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn root_id_is_preserved_across_generations() {
        let mut run = run_with_context(&[]);
        run.context
            .insert(CTX_ITERATION_ROOT.to_owned(), json!("gen0"));
        let decision = ApprovalDecision {
            decision: Decision::Reject,
            notes: None,
            feedback: None,
            restart_mode: RestartMode::Refine,
            iterate: true,
        };
        match plan_iteration(&run, &decision) {
            IterationPlan::Spawn { context, .. } => {
                assert_eq!(context[CTX_ITERATION_ROOT], "gen0");
                assert_eq!(context[CTX_ITERATION_PARENT], "parent");
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn record_decision_appends_to_shared_memory() {
        let mut run = run_with_context(&[]);
        let decision = ApprovalDecision {
            decision: Decision::Reject,
            notes: Some("nope".into()),
            feedback: Some("needs work".into()),
            restart_mode: RestartMode::Refine,
            iterate: false,
        };
        record_decision(&mut run, "draft", &decision);
        let memory = run.shared_memory().unwrap();
        assert_eq!(memory.decisions.len(), 1);
        assert_eq!(memory.feedback_history, vec!["needs work"]);
        assert_eq!(run.context[CTX_LATEST_FEEDBACK], "needs work");
    }

    #[test]
    fn decision_default_iterate_is_true() {
        let decision: ApprovalDecision =
            serde_json::from_value(json!({"decision": "reject"})).unwrap();
        assert!(decision.iterate);
        assert_eq!(decision.restart_mode, RestartMode::Refine);
    }
}
