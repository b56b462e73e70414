//! DAG parsing and validation.
//!
//! Deserialization handles shape (including rejection of unknown gate
//! types, since [`crate::gate::GateSpec`] is a tagged enum); `validate`
//! checks the structural invariants: unique block ids, edges referencing
//! existing blocks and declared ports, and acyclicity.

use serde_json::Value;

use crate::errors::{EngineError, ErrorCode};

use super::DagDef;

/// Parse a DAG definition from a JSON value and validate it.
pub fn parse_dag(value: &Value) -> Result<DagDef, EngineError> {
    let mut dag: DagDef = serde_json::from_value(value.clone())
        .map_err(|e| EngineError::invalid_input(format!("invalid dag definition: {e}")))?;

    // A block with no explicit name inherits its id.
    for block in &mut dag.blocks {
        if block.name.is_empty() {
            block.name = block.id.clone();
        }
    }

    validate(&dag)?;
    Ok(dag)
}

/// Validate structural invariants, collecting every problem before failing.
pub fn validate(dag: &DagDef) -> Result<(), EngineError> {
    let mut problems = Vec::new();

    if dag.name.trim().is_empty() {
        problems.push("dag name must not be empty".to_owned());
    }
    if dag.blocks.is_empty() {
        problems.push("dag must contain at least one block".to_owned());
    }

    // Unique block ids; shell gates are legal only before dispatch.
    let mut seen = std::collections::BTreeSet::new();
    for block in &dag.blocks {
        if block.id.trim().is_empty() {
            problems.push("block id must not be empty".to_owned());
        }
        if !seen.insert(block.id.as_str()) {
            problems.push(format!("duplicate block id {:?}", block.id));
        }
        if block
            .post_gates
            .iter()
            .any(|g| matches!(g, crate::gate::GateSpec::Shell { .. }))
        {
            problems.push(format!(
                "block {:?} uses a shell gate as a post-gate (pre-gate only)",
                block.id
            ));
        }
    }

    // Edges reference existing blocks and declared ports.
    for edge in &dag.edges {
        match dag.block(&edge.from_block) {
            None => problems.push(format!(
                "edge {} references unknown block {:?}",
                edge.display(),
                edge.from_block
            )),
            Some(from) => {
                if !from.outputs.contains_key(&edge.from_port) {
                    problems.push(format!(
                        "edge {} references undeclared output port {:?} on block {:?}",
                        edge.display(),
                        edge.from_port,
                        edge.from_block
                    ));
                }
            }
        }
        match dag.block(&edge.to_block) {
            None => problems.push(format!(
                "edge {} references unknown block {:?}",
                edge.display(),
                edge.to_block
            )),
            Some(to) => {
                if !to.inputs.contains_key(&edge.to_port) {
                    problems.push(format!(
                        "edge {} references undeclared input port {:?} on block {:?}",
                        edge.display(),
                        edge.to_port,
                        edge.to_block
                    ));
                }
            }
        }
    }

    // Acyclicity (only meaningful once ids are unique).
    if problems.is_empty() && dag.execution_order().is_none() {
        problems.push("dag contains a cycle".to_owned());
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(
            EngineError::new(ErrorCode::InvalidInput, "dag validation failed")
                .with_details(serde_json::json!({ "problems": problems })),
        )
    }
}
