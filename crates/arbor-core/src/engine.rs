//! The engine: one value owning every piece of cross-run state.
//!
//! Scoped per spec'd design: the active-run map, subscriber registry, and
//! safety timers all hang off an `Engine` constructed at startup (tests
//! build fresh ones), never off module globals. The in-memory maps use
//! plain mutexes and are never held across an await point; the queue claim
//! transaction is the admission serialization point.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value, json};
use sqlx::SqlitePool;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use arbor_db::models::{ApprovalStatus, Priority, QueueStatus, RunRow, RunStatus};
use arbor_db::queries::{approvals as approval_db, events as event_db, queue as queue_db, runs as run_db};

use crate::adapter::AdapterRegistry;
use crate::approval::{ApprovalDecision, Decision, DecisionApplied};
use crate::bus::EventBus;
use crate::errors::{EngineError, ErrorCode};
use crate::event::{EventEmitter, RunEvent};
use crate::executor::drive_run;
use crate::gate::llm::LlmReviewProvider;
use crate::graph::examples::example_dag;
use crate::graph::{DagDef, parser};
use crate::queue::pump_loop;
use crate::replay::rebuild;
use crate::run::{
    BlockError, BlockStatus, CTX_RUN_OPTIONS, CTX_SHARED_MEMORY, FailStage, Run, SharedMemory,
    StartRequest,
};
use crate::safety::SafetyLimits;

/// Shared slot for the reason a run's cancel token was tripped.
pub type CancelReason = Arc<StdMutex<Option<(String, String)>>>;

/// An approval decision routed to the waiting executor.
pub struct ApprovalSignal {
    pub token: String,
    pub block_id: String,
    pub decision: ApprovalDecision,
    pub reply: oneshot::Sender<DecisionApplied>,
}

pub(crate) struct ActiveRun {
    cancel: CancellationToken,
    cancel_reason: CancelReason,
    approval_tx: mpsc::UnboundedSender<ApprovalSignal>,
}

pub struct EngineInner {
    pub(crate) pool: SqlitePool,
    pub(crate) limits: SafetyLimits,
    pub(crate) adapters: AdapterRegistry,
    pub(crate) llm: Option<Arc<dyn LlmReviewProvider>>,
    pub(crate) bus: EventBus,
    pub(crate) emitter: EventEmitter,
    pub(crate) active: StdMutex<HashMap<String, ActiveRun>>,
    pub(crate) pump: Notify,
    pub(crate) shutdown: CancellationToken,
    /// Claim-owner id for this engine instance.
    pub(crate) owner: String,
}

/// The response to a start request.
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub run_id: String,
    pub dag_name: String,
    pub blocks: Vec<String>,
    pub edges: Vec<String>,
    pub queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueInfo {
    pub status: QueueStatus,
    pub position: Option<i64>,
    pub priority: i64,
}

/// Full state view for `GET /api/dag/runs/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct RunStateView {
    pub run: Value,
    pub status: RunStatus,
    pub dag: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<Value>,
    pub events: Vec<RunEvent>,
    pub trace: Value,
    pub durable: bool,
    pub reconstructed: bool,
}

/// How a stop request was honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    Active,
    Durable,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        pool: SqlitePool,
        limits: SafetyLimits,
        adapters: AdapterRegistry,
        llm: Option<Arc<dyn LlmReviewProvider>>,
    ) -> Self {
        let bus = EventBus::new();
        let emitter = EventEmitter::new(pool.clone(), bus.clone());
        Self {
            inner: Arc::new(EngineInner {
                pool,
                limits,
                adapters,
                llm,
                bus,
                emitter,
                active: StdMutex::new(HashMap::new()),
                pump: Notify::new(),
                shutdown: CancellationToken::new(),
                owner: format!("engine-{}", Uuid::new_v4()),
            }),
        }
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.inner.limits
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    /// Spawn the admission pump and the orphan reconciler. Call once after
    /// construction; idempotent enough for tests that never call it.
    pub fn start_background(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move { pump_loop(inner).await });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let period = (inner.limits.orphan_timeout() / 2)
                .max(std::time::Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                if let Err(e) = reconcile_orphans(&inner).await {
                    tracing::warn!(error = %e, "orphan reconciliation failed");
                }
            }
        });

        // Drain anything left queued by a previous process.
        self.inner.pump.notify_one();
    }

    /// Stop background tasks. In-flight runs keep their own cancel tokens.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        self.inner
            .active
            .lock()
            .expect("active map lock poisoned")
            .contains_key(run_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .active
            .lock()
            .expect("active map lock poisoned")
            .len()
    }

    /// Subscribe to a run's live events.
    pub fn subscribe(&self, run_id: &str, client_id: &str) -> mpsc::Receiver<RunEvent> {
        self.inner.bus.subscribe(run_id, client_id)
    }

    pub fn safety(&self) -> Value {
        self.inner.limits.to_json()
    }

    /// Start or enqueue a run.
    pub async fn submit(&self, req: StartRequest) -> Result<Submission, EngineError> {
        self.inner.clone().submit_internal(req, None, false).await
    }

    /// Cancel one run. Returns how the cancellation was applied.
    pub async fn stop_run(&self, run_id: &str) -> Result<StopMode, EngineError> {
        // Live: trip the token; the executor settles and persists.
        {
            let active = self.inner.active.lock().expect("active map lock poisoned");
            if let Some(entry) = active.get(run_id) {
                let mut reason = entry
                    .cancel_reason
                    .lock()
                    .expect("cancel reason lock poisoned");
                if reason.is_none() {
                    *reason = Some((
                        "stop requested".to_owned(),
                        ErrorCode::Cancelled.to_string(),
                    ));
                }
                entry.cancel.cancel();
                return Ok(StopMode::Active);
            }
        }

        // Durable: rewrite the snapshot directly.
        let row = run_db::run_row(&self.inner.pool, run_id)
            .await
            .map_err(EngineError::internal)?
            .ok_or_else(|| EngineError::not_found(format!("run {run_id} not found")))?;

        if row.status.is_terminal() {
            return Err(EngineError::invalid_state(format!(
                "run {run_id} is already {}",
                row.status
            )));
        }

        let mut run = parse_run_row(&row);
        run.skip_non_terminal_blocks();
        run.status = RunStatus::Cancelled;
        run.touch();
        let run_json = serde_json::to_string(&run).map_err(|e| EngineError::internal(e.into()))?;
        let updated =
            run_db::mark_run_terminal(&self.inner.pool, run_id, RunStatus::Cancelled, &run_json)
                .await
                .map_err(EngineError::internal)?;
        if updated > 0 {
            self.inner
                .emitter
                .emit(RunEvent::run_fail(
                    run_id,
                    "stop requested",
                    &ErrorCode::Cancelled.to_string(),
                ))
                .await;
            let _ = queue_db::mark_terminal(
                &self.inner.pool,
                run_id,
                QueueStatus::Cancelled,
                Some("stop requested"),
            )
            .await;
        }
        self.inner.pump.notify_one();
        Ok(StopMode::Durable)
    }

    /// Emergency stop: cancel every live run and every queued entry.
    pub async fn stop_all(&self) -> Result<(usize, usize), EngineError> {
        let stopped = {
            let active = self.inner.active.lock().expect("active map lock poisoned");
            for entry in active.values() {
                let mut reason = entry
                    .cancel_reason
                    .lock()
                    .expect("cancel reason lock poisoned");
                if reason.is_none() {
                    *reason = Some((
                        "emergency stop".to_owned(),
                        ErrorCode::Cancelled.to_string(),
                    ));
                }
                entry.cancel.cancel();
            }
            active.len()
        };

        let cancelled_ids = queue_db::cancel_all_pending(&self.inner.pool)
            .await
            .map_err(EngineError::internal)?;
        for run_id in &cancelled_ids {
            if let Ok(Some(row)) = run_db::run_row(&self.inner.pool, run_id).await {
                if !row.status.is_terminal() {
                    let mut run = parse_run_row(&row);
                    run.skip_non_terminal_blocks();
                    run.status = RunStatus::Cancelled;
                    run.touch();
                    if let Ok(run_json) = serde_json::to_string(&run) {
                        let _ = run_db::mark_run_terminal(
                            &self.inner.pool,
                            run_id,
                            RunStatus::Cancelled,
                            &run_json,
                        )
                        .await;
                    }
                    self.inner
                        .emitter
                        .emit(RunEvent::run_fail(
                            run_id,
                            "emergency stop",
                            &ErrorCode::Cancelled.to_string(),
                        ))
                        .await;
                }
            }
        }

        Ok((stopped, cancelled_ids.len()))
    }

    /// Decide a pending approval. `token` of `None` or `"latest"` targets
    /// the most recent pending request.
    pub async fn decide_approval(
        &self,
        run_id: &str,
        token: Option<&str>,
        decision: ApprovalDecision,
    ) -> Result<DecisionApplied, EngineError> {
        let exists = run_db::run_exists(&self.inner.pool, run_id)
            .await
            .map_err(EngineError::internal)?;
        if !exists && !self.is_active(run_id) {
            return Err(EngineError::not_found(format!("run {run_id} not found")));
        }

        let pending = approval_db::latest_pending_approval(&self.inner.pool, run_id)
            .await
            .map_err(EngineError::internal)?
            .ok_or_else(|| {
                EngineError::new(
                    ErrorCode::NoPendingApproval,
                    format!("run {run_id} has no pending approval"),
                )
            })?;

        if let Some(token) = token {
            if token != "latest" && token != pending.token {
                return Err(EngineError::new(
                    ErrorCode::InvalidApprovalToken,
                    "approval token does not match the pending request",
                ));
            }
        }

        let approval_tx = {
            let active = self.inner.active.lock().expect("active map lock poisoned");
            active.get(run_id).map(|entry| entry.approval_tx.clone())
        };
        let Some(approval_tx) = approval_tx else {
            return Err(EngineError::new(
                ErrorCode::NoPendingApproval,
                "run is not live; its pending approval cannot be resumed",
            )
            .with_details(json!({"run_id": run_id, "token": pending.token})));
        };

        // The durable CAS is the double-decision guard: the second caller
        // sees zero rows updated.
        let status = match decision.decision {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Reject => ApprovalStatus::Rejected,
        };
        let updated = approval_db::decide_approval(
            &self.inner.pool,
            &pending.token,
            status,
            None,
            decision.notes.as_deref(),
        )
        .await
        .map_err(EngineError::internal)?;
        if updated == 0 {
            return Err(EngineError::new(
                ErrorCode::NoPendingApproval,
                "approval was already decided",
            ));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let signal = ApprovalSignal {
            token: pending.token.clone(),
            block_id: pending.block_id.clone(),
            decision,
            reply: reply_tx,
        };
        approval_tx.send(signal).map_err(|_| {
            EngineError::invalid_state("run executor is no longer accepting decisions")
        })?;

        match tokio::time::timeout(std::time::Duration::from_secs(30), reply_rx).await {
            Ok(Ok(applied)) => Ok(applied),
            Ok(Err(_)) | Err(_) => Err(EngineError::invalid_state(
                "run executor did not acknowledge the decision",
            )),
        }
    }

    /// The most recent pending approval across all runs.
    pub async fn latest_pending_approval(&self) -> Result<Option<Value>, EngineError> {
        let row = approval_db::latest_pending_any(&self.inner.pool)
            .await
            .map_err(EngineError::internal)?;
        Ok(row.map(|row| approval_row_json(&row)))
    }

    /// Full state for one run: snapshot, dag, events, pending approval.
    pub async fn run_state(&self, run_id: &str) -> Result<RunStateView, EngineError> {
        let row = run_db::run_row(&self.inner.pool, run_id)
            .await
            .map_err(EngineError::internal)?
            .ok_or_else(|| EngineError::not_found(format!("run {run_id} not found")))?;

        let rows = event_db::events_since(&self.inner.pool, run_id, 0)
            .await
            .map_err(EngineError::internal)?;
        let events: Vec<RunEvent> = rows.iter().filter_map(RunEvent::from_row).collect();

        let (run_value, reconstructed) = match serde_json::from_str::<Run>(&row.run_json) {
            Ok(run) => (
                serde_json::to_value(&run).unwrap_or(Value::Null),
                false,
            ),
            Err(e) => {
                tracing::warn!(
                    run_id,
                    error = %e,
                    "run snapshot unreadable, rebuilding from events"
                );
                let run = rebuild(parse_run_row(&row), &events);
                (serde_json::to_value(&run).unwrap_or(Value::Null), true)
            }
        };

        let approval = approval_db::latest_pending_approval(&self.inner.pool, run_id)
            .await
            .map_err(EngineError::internal)?
            .map(|row| approval_row_json(&row));

        Ok(RunStateView {
            run: run_value,
            status: row.status,
            dag: serde_json::from_str(&row.dag_json).unwrap_or(Value::Null),
            approval,
            events,
            trace: serde_json::from_str(&row.trace_json).unwrap_or_else(|_| json!([])),
            durable: !self.is_active(run_id),
            reconstructed,
        })
    }

    /// Replay events after `since`. Returns the events and the next cursor.
    pub async fn replay(
        &self,
        run_id: &str,
        since: i64,
    ) -> Result<(Vec<RunEvent>, i64), EngineError> {
        let exists = run_db::run_exists(&self.inner.pool, run_id)
            .await
            .map_err(EngineError::internal)?;
        if !exists {
            return Err(EngineError::not_found(format!("run {run_id} not found")));
        }
        let rows = event_db::events_since(&self.inner.pool, run_id, since)
            .await
            .map_err(EngineError::internal)?;
        let events: Vec<RunEvent> = rows.iter().filter_map(RunEvent::from_row).collect();
        let next_since = events.last().map(|e| e.seq).unwrap_or(since);
        Ok((events, next_since))
    }

    /// List run rows with pagination.
    pub async fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<RunRow>, i64), EngineError> {
        let rows = run_db::list_runs(&self.inner.pool, status, limit, offset)
            .await
            .map_err(EngineError::internal)?;
        let total = run_db::count_runs(&self.inner.pool, status)
            .await
            .map_err(EngineError::internal)?;
        Ok((rows, total))
    }

    pub async fn queue_entries(&self) -> Result<Vec<arbor_db::models::QueueEntry>, EngineError> {
        queue_db::list_entries(&self.inner.pool, 200)
            .await
            .map_err(EngineError::internal)
    }

    /// PATCH a pending queue entry's priority / manual rank.
    pub async fn update_queue_entry(
        &self,
        run_id: &str,
        priority: Option<Priority>,
        manual_rank: Option<Option<i64>>,
    ) -> Result<(), EngineError> {
        let entry = queue_db::get_entry(&self.inner.pool, run_id)
            .await
            .map_err(EngineError::internal)?
            .ok_or_else(|| {
                EngineError::not_found(format!("queue entry {run_id} not found"))
            })?;
        if entry.status != QueueStatus::Pending {
            return Err(EngineError::invalid_state(format!(
                "queue entry {run_id} is {}, not pending",
                entry.status
            )));
        }
        let updated = queue_db::update_entry(
            &self.inner.pool,
            run_id,
            priority.map(|p| p.weight()),
            manual_rank,
        )
        .await
        .map_err(EngineError::internal)?;
        if updated == 0 {
            return Err(EngineError::invalid_state(format!(
                "queue entry {run_id} changed state during update"
            )));
        }
        Ok(())
    }

    /// Reassign manual ranks following the given order.
    pub async fn reorder_queue(&self, run_ids: &[String]) -> Result<u64, EngineError> {
        queue_db::reorder(&self.inner.pool, run_ids)
            .await
            .map_err(EngineError::internal)
    }

    /// Run one orphan reconciliation pass; returns reconciled run count.
    pub async fn reconcile_orphans(&self) -> Result<usize, EngineError> {
        reconcile_orphans(&self.inner)
            .await
            .map_err(EngineError::internal)
    }

    /// Nudge the admission pump (tests and CLI).
    pub fn notify_pump(&self) {
        self.inner.pump.notify_one();
    }
}

// ---------------------------------------------------------------------------
// Internals shared with the executor and pump
// ---------------------------------------------------------------------------

impl EngineInner {
    /// Start or enqueue a run. `reuse_run_id` carries a queued run's id so
    /// claim and execution share one identity; `skip_concurrency_gate` is
    /// set by the pump (the claim transaction already serialized
    /// admission).
    pub(crate) fn submit_internal(
        self: Arc<Self>,
        req: StartRequest,
        reuse_run_id: Option<String>,
        skip_concurrency_gate: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Submission, EngineError>> + Send>> {
        Box::pin(self.submit_internal_inner(req, reuse_run_id, skip_concurrency_gate))
    }

    async fn submit_internal_inner(
        self: Arc<Self>,
        req: StartRequest,
        reuse_run_id: Option<String>,
        skip_concurrency_gate: bool,
    ) -> Result<Submission, EngineError> {
        let mut dag = resolve_dag(&req)?;
        self.limits.clamp_dag(&mut dag);

        let run_id = reuse_run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let context = seed_context(&req);

        let blocks: Vec<String> = dag.blocks.iter().map(|b| b.id.clone()).collect();
        let edges: Vec<String> = dag.edges.iter().map(|e| e.display()).collect();

        // Admission: count + register under one lock acquisition so two
        // concurrent submits cannot both squeeze under the cap.
        let registered = {
            let mut active = self.active.lock().expect("active map lock poisoned");
            if !skip_concurrency_gate && active.len() >= self.limits.max_concurrent_runs {
                None
            } else {
                let cancel = CancellationToken::new();
                let cancel_reason: CancelReason = Arc::new(StdMutex::new(None));
                let (approval_tx, approval_rx) = mpsc::unbounded_channel();
                active.insert(
                    run_id.clone(),
                    ActiveRun {
                        cancel: cancel.clone(),
                        cancel_reason: cancel_reason.clone(),
                        approval_tx,
                    },
                );
                Some((cancel, cancel_reason, approval_rx))
            }
        };

        let Some((cancel, cancel_reason, approval_rx)) = registered else {
            return self.enqueue(req, run_id, dag, context, blocks, edges).await;
        };

        let run = Run::new(run_id.clone(), &dag, context);
        persist_new_run(&self.pool, &run, &dag).await?;

        let dag_name = dag.name.clone();
        tracing::info!(
            run_id = %run_id,
            dag_name = %dag_name,
            blocks = blocks.len(),
            "starting run"
        );

        let inner = self.clone();
        let spawn_run_id = run_id.clone();
        tokio::spawn(async move {
            let status = drive_run(
                inner.clone(),
                run,
                dag,
                req,
                cancel,
                cancel_reason,
                approval_rx,
            )
            .await;
            inner.finish_run(&spawn_run_id, status).await;
        });

        Ok(Submission {
            run_id,
            dag_name,
            blocks,
            edges,
            queued: false,
            queue: None,
        })
    }

    async fn enqueue(
        self: Arc<Self>,
        req: StartRequest,
        run_id: String,
        dag: DagDef,
        context: Map<String, Value>,
        blocks: Vec<String>,
        edges: Vec<String>,
    ) -> Result<Submission, EngineError> {
        let run = Run::new(run_id.clone(), &dag, context);
        persist_new_run(&self.pool, &run, &dag).await?;

        let priority = req.priority.unwrap_or_default().weight();
        let payload = serde_json::to_string(&req)
            .map_err(|e| EngineError::internal(e.into()))?;
        queue_db::enqueue(&self.pool, &run_id, priority, req.manual_rank, &payload)
            .await
            .map_err(EngineError::internal)?;

        let position = queue_db::queue_position(&self.pool, &run_id)
            .await
            .map_err(EngineError::internal)?;

        tracing::info!(
            run_id = %run_id,
            position = ?position,
            "concurrency cap reached, run queued"
        );

        // Capacity may have freed while we were enqueueing.
        self.pump.notify_one();

        Ok(Submission {
            run_id,
            dag_name: dag.name,
            blocks,
            edges,
            queued: true,
            queue: Some(QueueInfo {
                status: QueueStatus::Pending,
                position,
                priority,
            }),
        })
    }

    /// Post-run cleanup: drop the active entry, settle the queue entry,
    /// wake the pump.
    pub(crate) async fn finish_run(&self, run_id: &str, status: RunStatus) {
        {
            let mut active = self.active.lock().expect("active map lock poisoned");
            active.remove(run_id);
        }

        let queue_status = match status {
            RunStatus::Completed | RunStatus::Iterated => QueueStatus::Completed,
            RunStatus::Cancelled => QueueStatus::Cancelled,
            _ => QueueStatus::Failed,
        };
        let last_error = match status {
            RunStatus::Failed => Some("run failed"),
            RunStatus::Cancelled => Some("run cancelled"),
            _ => None,
        };
        if let Err(e) =
            queue_db::mark_terminal(&self.pool, run_id, queue_status, last_error).await
        {
            tracing::warn!(run_id, error = %e, "failed to settle queue entry");
        }

        tracing::info!(run_id, status = %status, "run finished");
        self.pump.notify_one();
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.lock().expect("active map lock poisoned").len()
    }

    pub(crate) fn is_active(&self, run_id: &str) -> bool {
        self.active
            .lock()
            .expect("active map lock poisoned")
            .contains_key(run_id)
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn resolve_dag(req: &StartRequest) -> Result<DagDef, EngineError> {
    match (&req.dag, &req.example) {
        (Some(value), _) => parser::parse_dag(value),
        (None, Some(name)) => example_dag(name).ok_or_else(|| {
            EngineError::new(
                ErrorCode::ExampleNotFound,
                format!("no example named {name:?}"),
            )
        }),
        (None, None) => Err(EngineError::invalid_input(
            "request must include either `dag` or `example`",
        )),
    }
}

/// Build the run context from a start request: caller context plus seeded
/// shared memory and the snapshotted run options.
fn seed_context(req: &StartRequest) -> Map<String, Value> {
    let mut context = req.context.clone().unwrap_or_default();

    if !context.contains_key(CTX_SHARED_MEMORY) {
        let memory = SharedMemory {
            original_intent: context
                .get("prompt")
                .and_then(Value::as_str)
                .map(str::to_owned),
            ..Default::default()
        };
        if let Ok(value) = serde_json::to_value(&memory) {
            context.insert(CTX_SHARED_MEMORY.to_owned(), value);
        }
    }

    context.insert(
        CTX_RUN_OPTIONS.to_owned(),
        json!({
            "provider": req.provider,
            "dev_mode": req.dev_mode,
            "model": req.model,
            "timeout_seconds": req.timeout_seconds,
        }),
    );

    context
}

async fn persist_new_run(
    pool: &SqlitePool,
    run: &Run,
    dag: &DagDef,
) -> Result<(), EngineError> {
    let dag_json = serde_json::to_string(dag).map_err(|e| EngineError::internal(e.into()))?;
    let run_json = serde_json::to_string(run).map_err(|e| EngineError::internal(e.into()))?;
    run_db::upsert_run(
        pool,
        &run.id,
        &run.dag_name,
        run.status,
        &dag_json,
        &run_json,
        "[]",
        run.created_at,
    )
    .await
    .map_err(EngineError::internal)
}

/// Best-effort decode of a stored snapshot; falls back to a bare run shell
/// so reconciliation can still terminalize a corrupt row.
fn parse_run_row(row: &RunRow) -> Run {
    if let Ok(run) = serde_json::from_str::<Run>(&row.run_json) {
        return run;
    }
    Run {
        id: row.id.clone(),
        dag_name: row.dag_name.clone(),
        status: row.status,
        blocks: Default::default(),
        context: Map::new(),
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

fn approval_row_json(row: &arbor_db::models::ApprovalRow) -> Value {
    json!({
        "token": row.token,
        "run_id": row.run_id,
        "block_id": row.block_id,
        "status": row.status,
        "prompt": row.prompt,
        "requested_at": row.requested_at,
        "decided_at": row.decided_at,
        "notes": row.notes,
    })
}

/// Mark stale, executor-less runs as failed (idempotently) and settle their
/// queue entries. Queued (pending/claimed) entries are exempt: they are
/// legitimately waiting for admission.
pub(crate) async fn reconcile_orphans(inner: &Arc<EngineInner>) -> anyhow::Result<usize> {
    let cutoff = Utc::now()
        - chrono::Duration::milliseconds(inner.limits.orphan_timeout_ms as i64);
    let stale = run_db::stale_active_runs(&inner.pool, cutoff).await?;
    let mut reconciled = 0;

    for row in stale {
        if inner.is_active(&row.id) {
            continue;
        }
        if let Ok(Some(entry)) = queue_db::get_entry(&inner.pool, &row.id).await {
            if matches!(entry.status, QueueStatus::Pending | QueueStatus::Claimed) {
                continue;
            }
        }

        let mut run = parse_run_row(&row);
        for instance in run.blocks.values_mut() {
            if instance.status == BlockStatus::Running
                || instance.status == BlockStatus::Retrying
            {
                instance.fail(BlockError::new(
                    FailStage::Snapshot,
                    ErrorCode::OrphanedRun,
                    "executor lost (orphaned run)",
                ));
            }
        }
        run.skip_non_terminal_blocks();
        run.status = RunStatus::Failed;
        run.touch();

        let run_json = serde_json::to_string(&run)?;
        let updated =
            run_db::mark_run_terminal(&inner.pool, &row.id, RunStatus::Failed, &run_json).await?;
        if updated > 0 {
            tracing::warn!(run_id = %row.id, "reconciled orphaned run");
            inner
                .emitter
                .emit(RunEvent::run_fail(
                    &row.id,
                    "orphaned run",
                    &ErrorCode::OrphanedRun.to_string(),
                ))
                .await;
            let _ = queue_db::mark_terminal(
                &inner.pool,
                &row.id,
                QueueStatus::Failed,
                Some("orphaned run"),
            )
            .await;
            reconciled += 1;
        }
    }

    Ok(reconciled)
}
