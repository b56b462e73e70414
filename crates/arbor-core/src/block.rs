//! The block executor: one block instance through its full lifecycle.
//!
//! Input resolution happens in the orchestrator (it owns the run); the
//! executor proper receives an immutable job, runs pre-gates, the dispatch
//! retry loop with contract repair, and post-gates, and reports the settled
//! instance back. Fatal errors never unwind out of here: every failure path
//! becomes a `failed` instance with an emitted `block:fail`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use crate::adapter::{DispatchOutcome, DispatchRequest, ProviderAdapter};
use crate::errors::ErrorCode;
use crate::event::{EventEmitter, RunEvent};
use crate::gate::{GateContext, compose_feedback, evaluate_gates};
use crate::gated::extract_json;
use crate::graph::{BlockDef, DagDef};
use crate::run::{
    BlockError, BlockInstance, BlockStatus, FailStage, Run, override_input_key,
};

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Effective limits for one block, already clamped by the safety caps.
#[derive(Debug, Clone)]
pub struct BlockLimits {
    /// Retries beyond the first attempt.
    pub max_attempts: u32,
    /// Per-attempt wall clock.
    pub timeout: Duration,
    pub max_tokens_per_block: Option<u64>,
}

/// Everything a spawned block task needs. Owned, so parallel blocks never
/// share mutable state.
pub struct BlockJob {
    pub run_id: String,
    pub block: BlockDef,
    pub instance: BlockInstance,
    pub inputs: Map<String, Value>,
    pub public_context: Map<String, Value>,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub gate_ctx: GateContext,
    pub limits: BlockLimits,
    pub cancel: CancellationToken,
    pub emitter: EventEmitter,
    pub model: Option<String>,
}

/// Sent back to the orchestrator when a block settles.
pub struct BlockDone {
    pub block_id: String,
    pub instance: BlockInstance,
    pub tokens_used: u64,
}

// ---------------------------------------------------------------------------
// Input resolution
// ---------------------------------------------------------------------------

/// Resolve a block's declared inputs: incoming edge value, then a context
/// binding by port name, then a per-block context override, then the port
/// default. A required port with no source fails with `MISSING_INPUT`.
pub fn resolve_inputs(
    run: &Run,
    dag: &DagDef,
    block: &BlockDef,
) -> Result<Map<String, Value>, BlockError> {
    let mut resolved = Map::new();

    for (port, def) in &block.inputs {
        let edge_value = dag
            .incoming_edges(&block.id)
            .find(|edge| edge.to_port == *port)
            .and_then(|edge| {
                run.blocks
                    .get(&edge.from_block)
                    .and_then(|upstream| upstream.outputs.get(&edge.from_port))
            })
            .cloned();

        let value = edge_value
            .or_else(|| run.context.get(port).cloned())
            .or_else(|| run.context.get(&override_input_key(&block.id, port)).cloned())
            .or_else(|| def.default.clone());

        match value {
            Some(value) => {
                resolved.insert(port.clone(), value);
            }
            None if def.required => {
                return Err(BlockError::new(
                    FailStage::Input,
                    ErrorCode::MissingInput,
                    format!("no value for required input port {port:?}"),
                ));
            }
            None => {}
        }
    }

    Ok(resolved)
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

enum AttemptFailure {
    Timeout(String),
    Dispatch(String),
    Contract {
        message: String,
        preview: String,
        repair: Option<String>,
    },
    PostGate(String),
}

/// Run one block to a terminal instance state.
pub async fn execute_block(mut job: BlockJob) -> BlockDone {
    let block_id = job.block.id.clone();
    let mut tokens_used: u64 = 0;

    job.instance.inputs_resolved = job.inputs.clone();
    job.instance.started_at = Some(Utc::now());
    job.instance.status = BlockStatus::Running;
    job.emitter
        .emit(RunEvent::block_start(&job.run_id, &block_id, &job.instance))
        .await;

    // Pre-gates: evaluate all for the audit trail, fail before dispatch.
    let input_value = Value::Object(job.inputs.clone());
    let pre_results = evaluate_gates(&job.block.pre_gates, &input_value, &job.gate_ctx).await;
    job.instance.pre_gate_results = pre_results.clone();
    if pre_results.iter().any(|r| !r.passed) {
        let blocked = pre_results.iter().any(|r| r.is_shell_blocked());
        let code = if blocked {
            ErrorCode::ShellGatesDisabled
        } else {
            ErrorCode::PreGateFailed
        };
        job.instance.fail(BlockError::new(
            FailStage::PreGate,
            code,
            compose_feedback(&pre_results),
        ));
        job.emitter
            .emit(RunEvent::block_fail(&job.run_id, &block_id, &job.instance))
            .await;
        return BlockDone {
            block_id,
            instance: job.instance,
            tokens_used,
        };
    }

    // Dispatch with retry. Post-gate failures re-enter here with feedback.
    let total_attempts = job.limits.max_attempts + 1;
    let mut feedback: Option<String> = None;
    let mut last_failure: Option<AttemptFailure> = None;

    for attempt in 1..=total_attempts {
        if job.cancel.is_cancelled() {
            fail_cancelled(&mut job, &block_id).await;
            return BlockDone {
                block_id,
                instance: job.instance,
                tokens_used,
            };
        }

        // Backoff applies from the second attempt on.
        let delay = job
            .block
            .retry
            .backoff
            .delay_ms(job.block.retry.delay_ms, attempt);
        if delay > 0 {
            let cancel = job.cancel.clone();
            let cancelled_during_backoff = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(Duration::from_millis(delay)) => false,
            };
            if cancelled_during_backoff {
                fail_cancelled(&mut job, &block_id).await;
                return BlockDone {
                    block_id,
                    instance: job.instance,
                    tokens_used,
                };
            }
        }

        job.instance.status = if attempt == 1 {
            BlockStatus::Running
        } else {
            BlockStatus::Retrying
        };
        job.instance.retry_state.attempt = attempt;

        let request = build_request(&job, attempt, feedback.as_deref());
        let outcome = dispatch_once(&job, &request).await;

        let outcome = match outcome {
            DispatchResult::Cancelled => {
                fail_cancelled(&mut job, &block_id).await;
                return BlockDone {
                    block_id,
                    instance: job.instance,
                    tokens_used,
                };
            }
            DispatchResult::TimedOut => {
                tracing::warn!(
                    run_id = %job.run_id,
                    block_id = %block_id,
                    attempt,
                    "block attempt timed out"
                );
                last_failure = Some(AttemptFailure::Timeout(format!(
                    "attempt {attempt} timed out after {}ms",
                    job.limits.timeout.as_millis()
                )));
                continue;
            }
            DispatchResult::Failed(message) => {
                tracing::warn!(
                    run_id = %job.run_id,
                    block_id = %block_id,
                    attempt,
                    error = %message,
                    "dispatch attempt failed"
                );
                last_failure = Some(AttemptFailure::Dispatch(message));
                continue;
            }
            DispatchResult::Succeeded(outcome) => outcome,
        };

        tokens_used += outcome.tokens_used.unwrap_or(0);
        if let Some(cap) = job.limits.max_tokens_per_block {
            if tokens_used > cap {
                job.instance.fail(BlockError::new(
                    FailStage::Dispatch,
                    ErrorCode::BudgetExceeded,
                    format!("block used {tokens_used} tokens, cap is {cap}"),
                ));
                job.emitter
                    .emit(RunEvent::block_fail(&job.run_id, &block_id, &job.instance))
                    .await;
                return BlockDone {
                    block_id,
                    instance: job.instance,
                    tokens_used,
                };
            }
        }

        let raw = outcome.output.unwrap_or_default();

        // Contract: with an output schema the output must parse and match,
        // with one repair redispatch allowed per attempt.
        let schema_opt = job.block.output_schema.clone();
        let value = match schema_opt {
            Some(schema) => {
                match enforce_contract(&mut job, schema, &raw, attempt, &mut tokens_used).await {
                    ContractResult::Ok(value) => value,
                    ContractResult::Cancelled => {
                        fail_cancelled(&mut job, &block_id).await;
                        return BlockDone {
                            block_id,
                            instance: job.instance,
                            tokens_used,
                        };
                    }
                    ContractResult::Mismatch {
                        message,
                        preview,
                        repair,
                    } => {
                        last_failure = Some(AttemptFailure::Contract {
                            message,
                            preview,
                            repair,
                        });
                        continue;
                    }
                }
            }
            None => parse_loose(&raw),
        };

        // Post-gates, appending each attempt's results to the audit trail.
        let post_results =
            evaluate_gates(&job.block.post_gates, &value, &job.gate_ctx).await;
        let all_passed = post_results.iter().all(|r| r.passed);
        job.instance.post_gate_results.extend(post_results.clone());

        if all_passed {
            job.instance.outputs = route_outputs(&job.block, value);
            job.instance.status = BlockStatus::Completed;
            job.instance.finished_at = Some(Utc::now());
            job.emitter
                .emit(RunEvent::block_complete(
                    &job.run_id,
                    &block_id,
                    &job.instance,
                ))
                .await;
            return BlockDone {
                block_id,
                instance: job.instance,
                tokens_used,
            };
        }

        let composed = compose_feedback(&post_results);
        tracing::info!(
            run_id = %job.run_id,
            block_id = %block_id,
            attempt,
            "post-gates failed, bouncing"
        );
        last_failure = Some(AttemptFailure::PostGate(composed.clone()));
        feedback = Some(composed);
    }

    // Attempts exhausted.
    let error = match last_failure {
        Some(AttemptFailure::Timeout(message)) => {
            BlockError::new(FailStage::Timeout, ErrorCode::Timeout, message)
        }
        Some(AttemptFailure::Dispatch(message)) => {
            BlockError::new(FailStage::Dispatch, ErrorCode::DispatchFailed, message)
        }
        Some(AttemptFailure::Contract {
            message,
            preview,
            repair,
        }) => {
            let mut error =
                BlockError::new(FailStage::Contract, ErrorCode::ContractFailed, message)
                    .with_preview(&preview);
            error.repair = repair;
            error
        }
        Some(AttemptFailure::PostGate(message)) => {
            BlockError::new(FailStage::PostGate, ErrorCode::GateExhaustion, message)
        }
        None => BlockError::new(
            FailStage::Dispatch,
            ErrorCode::DispatchFailed,
            "no attempts were executed",
        ),
    };
    job.instance.fail(error);
    job.emitter
        .emit(RunEvent::block_fail(&job.run_id, &block_id, &job.instance))
        .await;

    BlockDone {
        block_id,
        instance: job.instance,
        tokens_used,
    }
}

async fn fail_cancelled(job: &mut BlockJob, block_id: &str) {
    job.instance.fail(BlockError::new(
        FailStage::Cancelled,
        ErrorCode::Cancelled,
        "run was cancelled",
    ));
    job.emitter
        .emit(RunEvent::block_fail(&job.run_id, block_id, &job.instance))
        .await;
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

enum DispatchResult {
    Succeeded(DispatchOutcome),
    Failed(String),
    TimedOut,
    Cancelled,
}

fn build_request(job: &BlockJob, attempt: u32, feedback: Option<&str>) -> DispatchRequest {
    let mut description = job
        .inputs
        .get("prompt")
        .or_else(|| job.inputs.get("description"))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| {
            format!(
                "{}\nInputs: {}",
                job.block.name,
                Value::Object(job.inputs.clone())
            )
        });
    if let Some(feedback) = feedback {
        description.push_str("\n\n");
        description.push_str(feedback);
    }

    let mut context = job.public_context.clone();
    for (key, value) in &job.inputs {
        context.insert(key.clone(), value.clone());
    }

    DispatchRequest {
        title: job.block.name.clone(),
        description,
        context: Value::Object(context),
        acceptance_criteria: job.block.post_gates.iter().map(|g| g.label()).collect(),
        bounce_count: attempt - 1,
        agent: job.block.agent.as_ref().map(|a| a.key().to_owned()),
        system: None,
        output_schema: job.block.output_schema.clone(),
        model: job.model.clone(),
        deadline: Some(job.limits.timeout),
    }
}

async fn dispatch_once(job: &BlockJob, request: &DispatchRequest) -> DispatchResult {
    tokio::select! {
        _ = job.cancel.cancelled() => DispatchResult::Cancelled,
        result = tokio::time::timeout(
            job.limits.timeout,
            job.adapter.dispatch(request, job.cancel.child_token()),
        ) => match result {
            Err(_) => DispatchResult::TimedOut,
            Ok(Err(e)) => DispatchResult::Failed(format!("{e:#}")),
            Ok(Ok(outcome)) if !outcome.success => DispatchResult::Failed(
                outcome.error.unwrap_or_else(|| "adapter reported failure".to_owned()),
            ),
            Ok(Ok(outcome)) => DispatchResult::Succeeded(outcome),
        },
    }
}

// ---------------------------------------------------------------------------
// Contract repair
// ---------------------------------------------------------------------------

enum ContractResult {
    Ok(Value),
    Mismatch {
        message: String,
        preview: String,
        repair: Option<String>,
    },
    Cancelled,
}

async fn enforce_contract(
    job: &mut BlockJob,
    schema: Value,
    raw: &str,
    attempt: u32,
    tokens_used: &mut u64,
) -> ContractResult {
    match parse_and_validate(&schema, raw) {
        Ok(value) => ContractResult::Ok(value),
        Err(first_error) => {
            // One schema-repair redispatch per mismatched attempt; the
            // attempt itself is only consumed if the repair also misses.
            let repair_request = DispatchRequest {
                title: format!("{} (schema repair)", job.block.name),
                description: format!(
                    "The previous output did not match the required schema.\n\
                     Problems: {first_error}\n\
                     Re-emit the output as JSON matching the schema exactly.\n\
                     Previous output:\n{raw}"
                ),
                context: json!({}),
                acceptance_criteria: Vec::new(),
                bounce_count: attempt - 1,
                agent: job.block.agent.as_ref().map(|a| a.key().to_owned()),
                system: None,
                output_schema: Some(schema.clone()),
                model: job.model.clone(),
                deadline: Some(job.limits.timeout),
            };

            match dispatch_once(job, &repair_request).await {
                DispatchResult::Cancelled => ContractResult::Cancelled,
                DispatchResult::Succeeded(outcome) => {
                    *tokens_used += outcome.tokens_used.unwrap_or(0);
                    let repaired_raw = outcome.output.unwrap_or_default();
                    match parse_and_validate(&schema, &repaired_raw) {
                        Ok(value) => {
                            job.instance.error = None;
                            tracing::info!(
                                run_id = %job.run_id,
                                block_id = %job.block.id,
                                "schema repair succeeded"
                            );
                            ContractResult::Ok(value)
                        }
                        Err(second_error) => ContractResult::Mismatch {
                            message: second_error,
                            preview: repaired_raw,
                            repair: Some(format!(
                                "repair attempted after: {first_error}; still mismatched"
                            )),
                        },
                    }
                }
                DispatchResult::TimedOut => ContractResult::Mismatch {
                    message: first_error,
                    preview: raw.to_owned(),
                    repair: Some("repair dispatch timed out".to_owned()),
                },
                DispatchResult::Failed(e) => ContractResult::Mismatch {
                    message: first_error,
                    preview: raw.to_owned(),
                    repair: Some(format!("repair dispatch failed: {e}")),
                },
            }
        }
    }
}

fn parse_and_validate(schema: &Value, raw: &str) -> Result<Value, String> {
    let value = serde_json::from_str::<Value>(raw)
        .ok()
        .or_else(|| extract_json(raw))
        .ok_or_else(|| "output is not valid JSON".to_owned())?;
    let violations = crate::gate::schema::validate_value(schema, &value);
    if violations.is_empty() {
        Ok(value)
    } else {
        Err(violations
            .iter()
            .map(|v| format!("{}: {}", v.path, v.message))
            .collect::<Vec<_>>()
            .join("; "))
    }
}

/// Parse adapter output without a contract: JSON when it looks like JSON,
/// raw string otherwise.
fn parse_loose(raw: &str) -> Value {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Some(value) = serde_json::from_str(raw).ok().or_else(|| extract_json(raw)) {
            return value;
        }
    }
    Value::String(raw.to_owned())
}

// ---------------------------------------------------------------------------
// Output routing
// ---------------------------------------------------------------------------

/// Map a produced value onto the block's declared output ports.
///
/// An object value feeds ports by matching key; a single declared port
/// receives the whole value when no key matches; multiple ports with no
/// matching keys leave the others null.
fn route_outputs(block: &BlockDef, value: Value) -> Map<String, Value> {
    let mut outputs = Map::new();
    match &value {
        Value::Object(map) => {
            let any_match = block.outputs.keys().any(|port| map.contains_key(port));
            if any_match {
                for port in block.outputs.keys() {
                    outputs.insert(
                        port.clone(),
                        map.get(port).cloned().unwrap_or(Value::Null),
                    );
                }
            } else if block.outputs.len() == 1 {
                let port = block.outputs.keys().next().expect("one output port");
                outputs.insert(port.clone(), value);
            } else {
                for port in block.outputs.keys() {
                    outputs.insert(port.clone(), Value::Null);
                }
                outputs.insert("result".to_owned(), value);
            }
        }
        _ => {
            if let Some(port) = block.outputs.keys().next() {
                outputs.insert(port.clone(), value);
            } else {
                outputs.insert("result".to_owned(), value);
            }
        }
    }
    outputs
}
