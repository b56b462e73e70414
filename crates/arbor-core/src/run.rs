//! Per-run state: block instances, the run itself, reserved context keys,
//! and the cross-iteration shared memory.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use arbor_db::models::{Priority, RunStatus};

use crate::errors::ErrorCode;
use crate::gate::GateResult;
use crate::graph::DagDef;

// ---------------------------------------------------------------------------
// Reserved context keys
// ---------------------------------------------------------------------------

/// Serialized pending approval request.
pub const CTX_APPROVAL_REQUEST: &str = "__approval_request";
/// Cross-iteration scratchpad ([`SharedMemory`]).
pub const CTX_SHARED_MEMORY: &str = "__shared_memory";
/// Most recent reject feedback.
pub const CTX_LATEST_FEEDBACK: &str = "__latest_feedback";
/// Run id this run was iterated from.
pub const CTX_ITERATION_PARENT: &str = "__iteration_parent_run_id";
/// Root of the iteration chain.
pub const CTX_ITERATION_ROOT: &str = "__iteration_root_run_id";
/// Child run id recorded on an iterated parent.
pub const CTX_LATEST_ITERATED: &str = "__latest_iterated_run_id";
/// Original start-request options, snapshotted for iteration.
pub const CTX_RUN_OPTIONS: &str = "__run_options";

/// Context marker set when a block's approval is granted.
pub fn approval_marker_key(block_id: &str) -> String {
    format!("__approval_{block_id}")
}

/// Context override for a single input port.
pub fn override_input_key(block_id: &str, port: &str) -> String {
    format!("__override_input_{block_id}_{port}")
}

/// Whether a context key is engine-reserved.
pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with("__")
}

// ---------------------------------------------------------------------------
// Block instances
// ---------------------------------------------------------------------------

/// Lifecycle state of one block within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Pending,
    Ready,
    Running,
    Retrying,
    Completed,
    Failed,
    Skipped,
}

impl BlockStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// The stage at which a block failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailStage {
    Input,
    PreGate,
    Dispatch,
    Timeout,
    Contract,
    PostGate,
    Cancelled,
    Snapshot,
}

/// Maximum bytes of raw adapter output preserved on a failed instance.
pub const RAW_OUTPUT_PREVIEW_MAX: usize = 2048;

/// The first blocking cause recorded on a failed block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockError {
    pub stage: FailStage,
    pub message: String,
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output_preview: Option<String>,
    /// Summary of the schema-repair attempt, when one was made.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repair: Option<String>,
}

impl BlockError {
    pub fn new(stage: FailStage, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            code,
            raw_output_preview: None,
            repair: None,
        }
    }

    /// Attach a truncated raw-output preview.
    pub fn with_preview(mut self, raw: &str) -> Self {
        self.raw_output_preview = Some(truncate_preview(raw));
        self
    }
}

/// Truncate raw output to the preview cap on a char boundary.
pub fn truncate_preview(raw: &str) -> String {
    if raw.len() <= RAW_OUTPUT_PREVIEW_MAX {
        return raw.to_owned();
    }
    let mut end = RAW_OUTPUT_PREVIEW_MAX;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    raw[..end].to_owned()
}

/// Attempt bookkeeping for a block.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RetryState {
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Per-run state of one block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockInstance {
    pub status: BlockStatus,
    #[serde(default)]
    pub inputs_resolved: Map<String, Value>,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub pre_gate_results: Vec<GateResult>,
    #[serde(default)]
    pub post_gate_results: Vec<GateResult>,
    #[serde(default)]
    pub retry_state: RetryState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BlockError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BlockInstance {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            status: BlockStatus::Pending,
            inputs_resolved: Map::new(),
            outputs: Map::new(),
            pre_gate_results: Vec::new(),
            post_gate_results: Vec::new(),
            retry_state: RetryState {
                attempt: 0,
                max_attempts,
            },
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `failed`, recording the blocking cause and finish time.
    pub fn fail(&mut self, error: BlockError) {
        self.status = BlockStatus::Failed;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }
}

// ---------------------------------------------------------------------------
// Shared memory
// ---------------------------------------------------------------------------

fn default_max_cycles() -> u32 {
    5
}

/// Per-run scratchpad that survives reject-iteration cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedMemory {
    #[serde(default)]
    pub original_intent: Option<String>,
    #[serde(default)]
    pub feedback_history: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<Value>,
    #[serde(default)]
    pub cycle: u32,
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
}

impl Default for SharedMemory {
    fn default() -> Self {
        Self {
            original_intent: None,
            feedback_history: Vec::new(),
            decisions: Vec::new(),
            cycle: 0,
            max_cycles: default_max_cycles(),
        }
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// One execution instance of a DAG. Exclusively owned by its executor task;
/// everyone else observes through snapshots and the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub dag_name: String,
    pub status: RunStatus,
    pub blocks: BTreeMap<String, BlockInstance>,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Create a fresh run for a DAG, seeding one pending instance per block.
    /// `max_attempts` per block must already be clamped by the caller.
    pub fn new(id: String, dag: &DagDef, context: Map<String, Value>) -> Self {
        let now = Utc::now();
        let blocks = dag
            .blocks
            .iter()
            .map(|b| (b.id.clone(), BlockInstance::new(b.retry.max_attempts)))
            .collect();
        let mut run = Self {
            id,
            dag_name: dag.name.clone(),
            status: RunStatus::Pending,
            blocks,
            context,
            created_at: now,
            updated_at: now,
        };
        if run.shared_memory().is_none() {
            run.set_shared_memory(&SharedMemory::default());
        }
        run
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// All blocks terminal?
    pub fn all_terminal(&self) -> bool {
        self.blocks.values().all(|b| b.status.is_terminal())
    }

    /// Any block failed?
    pub fn any_failed(&self) -> bool {
        self.blocks
            .values()
            .any(|b| b.status == BlockStatus::Failed)
    }

    /// Ids of blocks not yet terminal.
    pub fn non_terminal_block_ids(&self) -> Vec<String> {
        self.blocks
            .iter()
            .filter(|(_, b)| !b.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Mark every non-terminal block `skipped`.
    pub fn skip_non_terminal_blocks(&mut self) {
        let now = Utc::now();
        for instance in self.blocks.values_mut() {
            if !instance.status.is_terminal() {
                instance.status = BlockStatus::Skipped;
                instance.finished_at = Some(now);
            }
        }
    }

    /// The shared memory scratchpad, if present and well-formed.
    pub fn shared_memory(&self) -> Option<SharedMemory> {
        self.context
            .get(CTX_SHARED_MEMORY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set_shared_memory(&mut self, memory: &SharedMemory) {
        if let Ok(value) = serde_json::to_value(memory) {
            self.context.insert(CTX_SHARED_MEMORY.to_owned(), value);
        }
    }

    /// Whether a block's approval marker is set.
    pub fn approval_granted(&self, block_id: &str) -> bool {
        self.context
            .get(&approval_marker_key(block_id))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// The context without reserved keys, e.g. for approval previews and
    /// adapter dispatch.
    pub fn public_context(&self) -> Map<String, Value> {
        self.context
            .iter()
            .filter(|(key, _)| !is_reserved_key(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Blocks ready to execute: `pending`, every incoming edge's source
    /// `completed`, and any approval either granted or not yet requested.
    pub fn ready_blocks(&self, dag: &DagDef) -> Vec<String> {
        let pending_request: Option<String> = self
            .context
            .get(CTX_APPROVAL_REQUEST)
            .and_then(|v| v.get("block_id"))
            .and_then(Value::as_str)
            .map(str::to_owned);

        dag.blocks
            .iter()
            .filter(|block| {
                let instance = match self.blocks.get(&block.id) {
                    Some(instance) => instance,
                    None => return false,
                };
                if instance.status != BlockStatus::Pending {
                    return false;
                }
                let upstream_done = dag.incoming_edges(&block.id).all(|edge| {
                    self.blocks
                        .get(&edge.from_block)
                        .map(|b| b.status == BlockStatus::Completed)
                        .unwrap_or(false)
                });
                if !upstream_done {
                    return false;
                }
                // A block whose approval was requested but not yet decided
                // is not ready.
                if block.needs_approval()
                    && !self.approval_granted(&block.id)
                    && pending_request.as_deref() == Some(block.id.as_str())
                {
                    return false;
                }
                true
            })
            .map(|block| block.id.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Start requests
// ---------------------------------------------------------------------------

/// The body of `POST /api/dag/run`, also serialized as the queue payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StartRequest {
    /// Inline DAG definition. Exactly one of `dag` / `example` is required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dag: Option<Value>,
    /// Name of a bundled example DAG.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
    /// Initial run context (entry-port values).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    /// Preferred provider adapter name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_rank: Option<i64>,
    #[serde(default, alias = "devMode")]
    pub dev_mode: bool,
    /// Agent-selector key to adapter-name mapping.
    #[serde(default, alias = "agentMapping", skip_serializing_if = "Option::is_none")]
    pub agent_mapping: Option<BTreeMap<String, String>>,
    #[serde(default, alias = "timeoutSeconds", skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}
