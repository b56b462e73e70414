//! The typed block graph: block definitions, edges, ports, and the derived
//! execution structure (entrypoints, topological order, readiness).

pub mod examples;
pub mod parser;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gate::GateSpec;

// ---------------------------------------------------------------------------
// Ports & selectors
// ---------------------------------------------------------------------------

/// The declared type of an input or output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    String,
    Number,
    Boolean,
    Json,
    Artifact,
}

/// An input or output port declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortDef {
    #[serde(rename = "type")]
    pub port_type: PortType,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Fallback value used when no edge or context binding supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn default_required() -> bool {
    true
}

/// How a block selects its provider agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentSelector {
    Id { id: String },
    Role { role: String },
    Capability { capability: String },
}

impl AgentSelector {
    /// The selector's key, used for adapter-mapping lookups.
    pub fn key(&self) -> &str {
        match self {
            Self::Id { id } => id,
            Self::Role { role } => role,
            Self::Capability { capability } => capability,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry & approval specs
// ---------------------------------------------------------------------------

/// Backoff strategy between dispatch attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    None,
    Linear,
    Exponential,
}

impl BackoffKind {
    /// Delay before `attempt` (1-based). The first attempt never waits.
    pub fn delay_ms(&self, delay_ms: u64, attempt: u32) -> u64 {
        if attempt <= 1 {
            return 0;
        }
        match self {
            Self::None => 0,
            Self::Linear => delay_ms.saturating_mul(attempt as u64),
            Self::Exponential => delay_ms.saturating_mul(1u64 << (attempt - 1).min(32)),
        }
    }
}

/// Per-block retry policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RetrySpec {
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default)]
    pub delay_ms: u64,
}

/// Human approval requirement on a block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalSpec {
    pub required: bool,
    #[serde(default)]
    pub prompt: String,
}

// ---------------------------------------------------------------------------
// Blocks & edges
// ---------------------------------------------------------------------------

/// A unit of work in the DAG. Dispatches to one provider adapter, guarded by
/// gates on either side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, PortDef>,
    #[serde(default)]
    pub outputs: BTreeMap<String, PortDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentSelector>,
    #[serde(default)]
    pub pre_gates: Vec<GateSpec>,
    #[serde(default)]
    pub post_gates: Vec<GateSpec>,
    #[serde(default)]
    pub retry: RetrySpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

impl BlockDef {
    /// Whether this block suspends the run for a human decision.
    pub fn needs_approval(&self) -> bool {
        self.approval.as_ref().map(|a| a.required).unwrap_or(false)
    }
}

/// A directed data edge: `from_block.from_port -> to_block.to_port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDef {
    pub from_block: String,
    pub from_port: String,
    pub to_block: String,
    pub to_port: String,
}

impl EdgeDef {
    /// Render as `a.out -> b.in` for responses and logs.
    pub fn display(&self) -> String {
        format!(
            "{}.{} -> {}.{}",
            self.from_block, self.from_port, self.to_block, self.to_port
        )
    }
}

// ---------------------------------------------------------------------------
// DAG
// ---------------------------------------------------------------------------

/// A validated pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagDef {
    pub name: String,
    pub blocks: Vec<BlockDef>,
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
}

impl DagDef {
    pub fn block(&self, id: &str) -> Option<&BlockDef> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn block_mut(&mut self, id: &str) -> Option<&mut BlockDef> {
        self.blocks.iter_mut().find(|b| b.id == id)
    }

    pub fn incoming_edges<'a>(&'a self, block_id: &'a str) -> impl Iterator<Item = &'a EdgeDef> {
        self.edges.iter().filter(move |e| e.to_block == block_id)
    }

    pub fn outgoing_edges<'a>(&'a self, block_id: &'a str) -> impl Iterator<Item = &'a EdgeDef> {
        self.edges.iter().filter(move |e| e.from_block == block_id)
    }

    /// Blocks with no incoming edges.
    pub fn entrypoints(&self) -> Vec<&BlockDef> {
        self.blocks
            .iter()
            .filter(|b| self.incoming_edges(&b.id).next().is_none())
            .collect()
    }

    /// Input ports that must be satisfied from the run context: required,
    /// no incoming edge, no default. Returned as `(block_id, port)` pairs.
    pub fn required_from_context(&self) -> Vec<(&str, &str)> {
        let mut out = Vec::new();
        for block in &self.blocks {
            for (port, def) in &block.inputs {
                if !def.required || def.default.is_some() {
                    continue;
                }
                let has_edge = self
                    .incoming_edges(&block.id)
                    .any(|e| e.to_port == *port);
                if !has_edge {
                    out.push((block.id.as_str(), port.as_str()));
                }
            }
        }
        out
    }

    /// Kahn topological order, ties broken by block id ascending.
    ///
    /// Returns `None` when the graph has a cycle.
    pub fn execution_order(&self) -> Option<Vec<String>> {
        use std::collections::BTreeSet;

        let mut indegree: BTreeMap<&str, usize> =
            self.blocks.iter().map(|b| (b.id.as_str(), 0)).collect();
        for edge in &self.edges {
            if let Some(count) = indegree.get_mut(edge.to_block.as_str()) {
                *count += 1;
            }
        }

        let mut ready: BTreeSet<&str> = indegree
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut order = Vec::with_capacity(self.blocks.len());
        while let Some(&id) = ready.iter().next() {
            ready.remove(id);
            order.push(id.to_owned());
            for edge in self.outgoing_edges(id) {
                if let Some(count) = indegree.get_mut(edge.to_block.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(edge.to_block.as_str());
                    }
                }
            }
        }

        if order.len() == self.blocks.len() {
            Some(order)
        } else {
            None
        }
    }
}
