//! The per-run DAG executor.
//!
//! One orchestrator task owns the [`Run`] and submits ready blocks to a
//! semaphore-bounded worker pool; settled blocks come back over an mpsc
//! channel. Approvals suspend submission on a channel receive (in-flight
//! blocks settle while paused), cancellation drains in-flight work before
//! the run goes terminal, and a stall timer with three grace rearms guards
//! against wedged adapters.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use arbor_db::models::RunStatus;

use crate::adapter::ProviderAdapter;
use crate::approval::{
    ApprovalRequest, Decision, DecisionApplied, IterationPlan, plan_iteration, record_decision,
};
use crate::block::{BlockDone, BlockJob, BlockLimits, execute_block, resolve_inputs};
use crate::engine::{ApprovalSignal, CancelReason, EngineInner};
use crate::errors::ErrorCode;
use crate::event::RunEvent;
use crate::gate::GateContext;
use crate::graph::{BlockDef, DagDef};
use crate::run::{
    BlockError, BlockStatus, CTX_APPROVAL_REQUEST, CTX_LATEST_ITERATED, FailStage, Run,
    StartRequest, approval_marker_key, override_input_key,
};

/// How long in-flight blocks get to settle after cancellation.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace rearms granted by the stall guard before forcing cancellation.
const STALL_GRACE_REARMS: u32 = 3;

/// Outcome of handling an approval decision inside the loop.
enum DecisionFlow {
    Continue,
    Terminal(RunStatus),
}

/// Drive a run to a terminal status. The caller (engine) registers the
/// active-run entry before spawning this and cleans it up afterwards.
pub(crate) async fn drive_run(
    inner: Arc<EngineInner>,
    mut run: Run,
    dag: DagDef,
    req: StartRequest,
    cancel: CancellationToken,
    cancel_reason: CancelReason,
    mut approval_rx: mpsc::UnboundedReceiver<ApprovalSignal>,
) -> RunStatus {
    let run_id = run.id.clone();
    let dag_json = serde_json::to_string(&dag).unwrap_or_else(|_| "{}".to_owned());
    let mut trace: Vec<Value> = Vec::new();

    run.status = RunStatus::Running;
    run.touch();
    persist(&inner, &run, &dag_json, &trace).await;
    let event = inner
        .emitter
        .emit(RunEvent::run_start(&run_id, &run.dag_name, run.blocks.len()))
        .await;
    push_trace(&mut trace, &event);

    let gate_ctx = GateContext {
        llm: inner.llm.clone(),
        shell_enabled: inner.limits.shell_gates_enabled,
    };

    let semaphore = Arc::new(Semaphore::new(inner.limits.max_parallel_blocks.max(1)));
    let (tx, mut rx) = mpsc::channel::<BlockDone>(inner.limits.max_parallel_blocks.max(1) * 2);
    let mut in_flight: usize = 0;
    let mut submitted: HashSet<String> = HashSet::new();
    let mut run_tokens: u64 = 0;

    let run_duration = req
        .timeout_seconds
        .map(Duration::from_secs)
        .unwrap_or_else(|| inner.limits.max_run_duration())
        .min(inner.limits.max_run_duration());
    let run_deadline = Instant::now() + run_duration;
    let stall_timeout = inner.limits.stall_timeout();
    let mut stall_deadline = Instant::now() + stall_timeout;
    let mut stall_grace: u32 = 0;

    loop {
        // Cancellation: stop submitting, let in-flight work settle, then go
        // terminal.
        if cancel.is_cancelled() {
            tracing::info!(run_id = %run_id, "run cancelled, draining in-flight blocks");
            let drain_deadline = Instant::now() + DRAIN_TIMEOUT;
            while in_flight > 0 {
                match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
                    Ok(Some(done)) => {
                        in_flight -= 1;
                        merge_done(&mut run, done, &mut run_tokens);
                    }
                    _ => break,
                }
            }
            if in_flight > 0 {
                tracing::warn!(
                    run_id = %run_id,
                    remaining = in_flight,
                    "drain timeout expired with blocks still in flight"
                );
            }
            run.skip_non_terminal_blocks();
            run.status = RunStatus::Cancelled;
            run.touch();
            let (reason, code) = cancel_reason
                .lock()
                .expect("cancel reason lock poisoned")
                .clone()
                .unwrap_or_else(|| ("cancelled".to_owned(), ErrorCode::Cancelled.to_string()));
            let event = inner
                .emitter
                .emit(RunEvent::run_fail(&run_id, &reason, &code))
                .await;
            push_trace(&mut trace, &event);
            persist(&inner, &run, &dag_json, &trace).await;
            return RunStatus::Cancelled;
        }

        // Drain settled blocks without blocking.
        while let Ok(done) = rx.try_recv() {
            in_flight -= 1;
            merge_done(&mut run, done, &mut run_tokens);
            run.touch();
            persist(&inner, &run, &dag_json, &trace).await;
            stall_deadline = Instant::now() + stall_timeout;
            stall_grace = 0;
        }

        // Terminal resolution: every block settled.
        if run.all_terminal() && in_flight == 0 {
            return finish_run(&inner, &mut run, &dag_json, &mut trace).await;
        }

        // Approval pause: no further submissions, but in-flight blocks may
        // settle and decisions arrive over the channel.
        if run.status == RunStatus::PausedApproval {
            tokio::select! {
                _ = cancel.cancelled() => continue,
                Some(done) = rx.recv(), if in_flight > 0 => {
                    in_flight -= 1;
                    merge_done(&mut run, done, &mut run_tokens);
                    run.touch();
                    persist(&inner, &run, &dag_json, &trace).await;
                }
                signal = approval_rx.recv() => {
                    match signal {
                        Some(signal) => {
                            match handle_decision(
                                &inner, &mut run, &dag, &req, signal, &dag_json, &mut trace,
                            )
                            .await
                            {
                                DecisionFlow::Continue => {}
                                DecisionFlow::Terminal(status) => return status,
                            }
                        }
                        // Engine dropped the sender; treat as shutdown.
                        None => {
                            cancel.cancel();
                        }
                    }
                }
            }
            continue;
        }

        // Submit ready blocks.
        let ready = run.ready_blocks(&dag);
        let mut submitted_any = false;
        let mut paused = false;

        for block_id in ready {
            if submitted.contains(&block_id) {
                continue;
            }
            let block = match dag.block(&block_id) {
                Some(block) => block.clone(),
                None => continue,
            };

            // Approval preflight: pause the run before this block runs.
            if block.needs_approval() && !run.approval_granted(&block_id) {
                initiate_approval(&inner, &mut run, &block, &dag_json, &mut trace).await;
                paused = true;
                break;
            }

            // Run-level budget.
            if let Some(cap) = inner.limits.max_tokens_per_run {
                if run_tokens >= cap {
                    fail_block_inline(
                        &inner,
                        &mut run,
                        &block_id,
                        BlockError::new(
                            FailStage::Dispatch,
                            ErrorCode::BudgetExceeded,
                            format!("run used {run_tokens} tokens, cap is {cap}"),
                        ),
                        &mut trace,
                    )
                    .await;
                    persist(&inner, &run, &dag_json, &trace).await;
                    continue;
                }
            }

            // Inputs.
            let inputs = match resolve_inputs(&run, &dag, &block) {
                Ok(inputs) => inputs,
                Err(error) => {
                    fail_block_inline(&inner, &mut run, &block_id, error, &mut trace).await;
                    persist(&inner, &run, &dag_json, &trace).await;
                    continue;
                }
            };

            let adapter = match resolve_adapter(&inner, &req, &block) {
                Some(adapter) => adapter,
                None => {
                    fail_block_inline(
                        &inner,
                        &mut run,
                        &block_id,
                        BlockError::new(
                            FailStage::Dispatch,
                            ErrorCode::DispatchFailed,
                            "no provider adapter registered",
                        ),
                        &mut trace,
                    )
                    .await;
                    persist(&inner, &run, &dag_json, &trace).await;
                    continue;
                }
            };

            // Worker-pool slot (blocks when the pool is saturated).
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let mut instance = run
                .blocks
                .get(&block_id)
                .cloned()
                .unwrap_or_else(|| crate::run::BlockInstance::new(block.retry.max_attempts));
            instance.status = BlockStatus::Ready;
            if let Some(run_instance) = run.blocks.get_mut(&block_id) {
                run_instance.status = BlockStatus::Ready;
            }

            let job = BlockJob {
                run_id: run_id.clone(),
                limits: BlockLimits {
                    max_attempts: block.retry.max_attempts.min(inner.limits.max_retries_cap),
                    timeout: Duration::from_millis(
                        block
                            .timeout_ms
                            .unwrap_or(inner.limits.max_block_duration_ms)
                            .min(inner.limits.max_block_duration_ms),
                    ),
                    max_tokens_per_block: inner.limits.max_tokens_per_block,
                },
                block,
                instance,
                inputs,
                public_context: run.public_context(),
                adapter,
                gate_ctx: gate_ctx.clone(),
                cancel: cancel.child_token(),
                emitter: inner.emitter.clone(),
                model: req.model.clone(),
            };

            submitted.insert(block_id.clone());
            in_flight += 1;
            submitted_any = true;

            let tx_clone = tx.clone();
            tokio::spawn(async move {
                let done = execute_block(job).await;
                drop(permit);
                let _ = tx_clone.send(done).await;
            });
        }

        if paused {
            continue;
        }

        // Dead path: something failed and nothing can make progress.
        if in_flight == 0 && !run.all_terminal() && run.ready_blocks(&dag).is_empty() {
            let reason = if run.any_failed() {
                "upstream block failed".to_owned()
            } else {
                "no runnable blocks remain".to_owned()
            };
            run.skip_non_terminal_blocks();
            run.status = RunStatus::Failed;
            run.touch();
            let code = first_error_code(&run);
            let event = inner
                .emitter
                .emit(RunEvent::run_fail(&run_id, &reason, &code))
                .await;
            push_trace(&mut trace, &event);
            persist(&inner, &run, &dag_json, &trace).await;
            return RunStatus::Failed;
        }

        // Wait for the next interesting thing.
        if in_flight > 0 {
            tokio::select! {
                done = rx.recv() => {
                    if let Some(done) = done {
                        in_flight -= 1;
                        merge_done(&mut run, done, &mut run_tokens);
                        run.touch();
                        persist(&inner, &run, &dag_json, &trace).await;
                        stall_deadline = Instant::now() + stall_timeout;
                        stall_grace = 0;
                    }
                }
                _ = cancel.cancelled() => continue,
                _ = tokio::time::sleep_until(run_deadline) => {
                    set_cancel_reason(
                        &cancel_reason,
                        "max run duration exceeded",
                        ErrorCode::Timeout,
                    );
                    cancel.cancel();
                }
                _ = tokio::time::sleep_until(stall_deadline) => {
                    stall_grace += 1;
                    if stall_grace > STALL_GRACE_REARMS {
                        tracing::warn!(
                            run_id = %run_id,
                            "stall grace exhausted, cancelling run"
                        );
                        set_cancel_reason(
                            &cancel_reason,
                            "stall_timeout_exceeded",
                            ErrorCode::StallTimeout,
                        );
                        cancel.cancel();
                    } else {
                        tracing::warn!(
                            run_id = %run_id,
                            grace = stall_grace,
                            max_grace = STALL_GRACE_REARMS,
                            "stall timer fired with blocks running, rearming"
                        );
                        stall_deadline = Instant::now() + stall_timeout;
                    }
                }
            }
        } else if !submitted_any {
            // Nothing in flight, nothing submitted: brief sleep to avoid a
            // busy loop before re-checking readiness.
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                _ = cancel.cancelled() => continue,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Loop helpers
// ---------------------------------------------------------------------------

fn set_cancel_reason(reason: &CancelReason, text: &str, code: ErrorCode) {
    let mut guard = reason.lock().expect("cancel reason lock poisoned");
    if guard.is_none() {
        *guard = Some((text.to_owned(), code.to_string()));
    }
}

fn merge_done(run: &mut Run, done: BlockDone, run_tokens: &mut u64) {
    *run_tokens += done.tokens_used;
    run.blocks.insert(done.block_id, done.instance);
}

fn push_trace(trace: &mut Vec<Value>, event: &RunEvent) {
    trace.push(json!({
        "seq": event.seq,
        "type": event.event_type,
        "block_id": event.block_id,
        "timestamp": event.timestamp,
    }));
}

async fn persist(inner: &Arc<EngineInner>, run: &Run, dag_json: &str, trace: &[Value]) {
    let run_json = match serde_json::to_string(run) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(run_id = %run.id, error = %e, "failed to serialize run snapshot");
            return;
        }
    };
    let trace_json =
        serde_json::to_string(trace).unwrap_or_else(|_| "[]".to_owned());
    if let Err(e) = arbor_db::queries::runs::upsert_run(
        &inner.pool,
        &run.id,
        &run.dag_name,
        run.status,
        dag_json,
        &run_json,
        &trace_json,
        run.created_at,
    )
    .await
    {
        tracing::warn!(run_id = %run.id, error = %e, "failed to persist run snapshot");
    }
}

/// Fail a block without dispatching it (budget, missing input, no adapter).
async fn fail_block_inline(
    inner: &Arc<EngineInner>,
    run: &mut Run,
    block_id: &str,
    error: BlockError,
    trace: &mut Vec<Value>,
) {
    if let Some(instance) = run.blocks.get_mut(block_id) {
        instance.fail(error);
        let event = inner
            .emitter
            .emit(RunEvent::block_fail(&run.id, block_id, instance))
            .await;
        push_trace(trace, &event);
    }
    run.touch();
}

fn first_error_code(run: &Run) -> String {
    run.blocks
        .values()
        .find_map(|b| b.error.as_ref().map(|e| e.code.to_string()))
        .unwrap_or_else(|| ErrorCode::DispatchFailed.to_string())
}

async fn finish_run(
    inner: &Arc<EngineInner>,
    run: &mut Run,
    dag_json: &str,
    trace: &mut Vec<Value>,
) -> RunStatus {
    if run.any_failed() {
        run.status = RunStatus::Failed;
        run.touch();
        let code = first_error_code(run);
        let event = inner
            .emitter
            .emit(RunEvent::run_fail(&run.id, "one or more blocks failed", &code))
            .await;
        push_trace(trace, &event);
    } else {
        run.status = RunStatus::Completed;
        run.touch();
        let event = inner.emitter.emit(RunEvent::run_complete(&run.id)).await;
        push_trace(trace, &event);
    }
    persist(inner, run, dag_json, trace).await;
    run.status
}

fn resolve_adapter(
    inner: &Arc<EngineInner>,
    req: &StartRequest,
    block: &BlockDef,
) -> Option<Arc<dyn ProviderAdapter>> {
    if req.dev_mode {
        if let Some(echo) = inner.adapters.get("echo") {
            return Some(echo);
        }
    }
    let mapped = block.agent.as_ref().and_then(|selector| {
        req.agent_mapping
            .as_ref()
            .and_then(|mapping| mapping.get(selector.key()))
            .map(String::as_str)
    });
    inner
        .adapters
        .resolve(mapped.or(req.provider.as_deref()))
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

async fn initiate_approval(
    inner: &Arc<EngineInner>,
    run: &mut Run,
    block: &BlockDef,
    dag_json: &str,
    trace: &mut Vec<Value>,
) {
    let prompt = block
        .approval
        .as_ref()
        .map(|a| a.prompt.clone())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| format!("Approve block {:?} before it runs", block.id));

    let request = ApprovalRequest::new(run, &block.id, &prompt);

    if let Ok(value) = serde_json::to_value(&request) {
        run.context.insert(CTX_APPROVAL_REQUEST.to_owned(), value);
    }
    run.status = RunStatus::PausedApproval;
    run.touch();

    let payload_json = serde_json::to_string(&request).unwrap_or_else(|_| "{}".to_owned());
    let new_approval = arbor_db::queries::approvals::NewApproval {
        token: &request.token,
        run_id: &run.id,
        block_id: &request.block_id,
        prompt: &request.prompt,
        requested_at: request.requested_at,
        payload_json: &payload_json,
    };
    if let Err(e) =
        arbor_db::queries::approvals::upsert_approval(&inner.pool, &new_approval).await
    {
        tracing::warn!(run_id = %run.id, error = %e, "failed to persist approval request");
    }

    let event = inner
        .emitter
        .emit(RunEvent::approval_requested(&run.id, &request))
        .await;
    push_trace(trace, &event);
    persist(inner, run, dag_json, trace).await;

    tracing::info!(
        run_id = %run.id,
        block_id = %block.id,
        token = %request.token,
        "run paused for approval"
    );
}

async fn handle_decision(
    inner: &Arc<EngineInner>,
    run: &mut Run,
    dag: &DagDef,
    req: &StartRequest,
    signal: ApprovalSignal,
    dag_json: &str,
    trace: &mut Vec<Value>,
) -> DecisionFlow {
    let block_id = signal.block_id.clone();
    let decision = signal.decision.clone();

    record_decision(run, &block_id, &decision);

    let decision_name = match decision.decision {
        Decision::Approve => "approve",
        Decision::Reject => "reject",
    };
    let event = inner
        .emitter
        .emit(RunEvent::approval_decided(
            &run.id,
            &block_id,
            decision_name,
            decision.notes.as_deref(),
        ))
        .await;
    push_trace(trace, &event);

    match decision.decision {
        Decision::Approve => {
            run.context
                .insert(approval_marker_key(&block_id), json!(true));
            run.context
                .insert(override_input_key(&block_id, "approved"), json!(true));
            run.context.remove(CTX_APPROVAL_REQUEST);
            run.status = RunStatus::Running;
            run.touch();
            persist(inner, run, dag_json, trace).await;
            let _ = signal.reply.send(DecisionApplied {
                decision: Decision::Approve,
                run_status: RunStatus::Running,
                iterated_run_id: None,
            });
            DecisionFlow::Continue
        }
        Decision::Reject => {
            run.context.remove(CTX_APPROVAL_REQUEST);

            if !decision.iterate {
                run.skip_non_terminal_blocks();
                run.status = RunStatus::Failed;
                run.touch();
                let event = inner
                    .emitter
                    .emit(RunEvent::run_fail(
                        &run.id,
                        "approval rejected",
                        "APPROVAL_REJECTED",
                    ))
                    .await;
                push_trace(trace, &event);
                persist(inner, run, dag_json, trace).await;
                let _ = signal.reply.send(DecisionApplied {
                    decision: Decision::Reject,
                    run_status: RunStatus::Failed,
                    iterated_run_id: None,
                });
                return DecisionFlow::Terminal(RunStatus::Failed);
            }

            match plan_iteration(run, &decision) {
                IterationPlan::MaxCyclesReached { cycle, max_cycles } => {
                    run.context.insert(
                        "iteration_stopped".to_owned(),
                        json!("max_cycles_reached"),
                    );
                    run.skip_non_terminal_blocks();
                    run.status = RunStatus::Failed;
                    run.touch();
                    tracing::warn!(
                        run_id = %run.id,
                        cycle,
                        max_cycles,
                        "iteration budget exhausted"
                    );
                    let event = inner
                        .emitter
                        .emit(RunEvent::run_fail(
                            &run.id,
                            "max_cycles_reached",
                            &ErrorCode::MaxCyclesReached.to_string(),
                        ))
                        .await;
                    push_trace(trace, &event);
                    persist(inner, run, dag_json, trace).await;
                    let _ = signal.reply.send(DecisionApplied {
                        decision: Decision::Reject,
                        run_status: RunStatus::Failed,
                        iterated_run_id: None,
                    });
                    DecisionFlow::Terminal(RunStatus::Failed)
                }
                IterationPlan::Spawn { context, cycle } => {
                    let child_req = StartRequest {
                        dag: Some(
                            serde_json::to_value(dag).unwrap_or_else(|_| json!({})),
                        ),
                        example: None,
                        context: Some(context),
                        provider: req.provider.clone(),
                        priority: req.priority,
                        manual_rank: None,
                        dev_mode: req.dev_mode,
                        agent_mapping: req.agent_mapping.clone(),
                        timeout_seconds: req.timeout_seconds,
                        model: req.model.clone(),
                    };

                    let child = inner.clone().submit_internal(child_req, None, false).await;
                    let child_id = match child {
                        Ok(submission) => submission.run_id,
                        Err(e) => {
                            tracing::error!(
                                run_id = %run.id,
                                error = %e,
                                "failed to start iteration run"
                            );
                            run.skip_non_terminal_blocks();
                            run.status = RunStatus::Failed;
                            run.touch();
                            persist(inner, run, dag_json, trace).await;
                            let _ = signal.reply.send(DecisionApplied {
                                decision: Decision::Reject,
                                run_status: RunStatus::Failed,
                                iterated_run_id: None,
                            });
                            return DecisionFlow::Terminal(RunStatus::Failed);
                        }
                    };

                    run.context
                        .insert(CTX_LATEST_ITERATED.to_owned(), json!(child_id));
                    run.skip_non_terminal_blocks();
                    run.status = RunStatus::Iterated;
                    run.touch();
                    let event = inner
                        .emitter
                        .emit(RunEvent::run_iterated(&run.id, &child_id, cycle))
                        .await;
                    push_trace(trace, &event);
                    persist(inner, run, dag_json, trace).await;
                    tracing::info!(
                        run_id = %run.id,
                        child_run_id = %child_id,
                        cycle,
                        "run iterated"
                    );
                    let _ = signal.reply.send(DecisionApplied {
                        decision: Decision::Reject,
                        run_status: RunStatus::Iterated,
                        iterated_run_id: Some(child_id),
                    });
                    DecisionFlow::Terminal(RunStatus::Iterated)
                }
            }
        }
    }
}
