//! Named example pipelines, resolvable via `{"example": "<name>"}` in a
//! start request.

use std::collections::BTreeMap;

use serde_json::json;

use crate::gate::GateSpec;

use super::{
    ApprovalSpec, BackoffKind, BlockDef, DagDef, EdgeDef, PortDef, PortType, RetrySpec,
};

/// Names of the bundled examples.
pub fn example_names() -> Vec<&'static str> {
    vec!["two-step", "reviewed-draft", "fan-out"]
}

/// Look up a bundled example by name.
pub fn example_dag(name: &str) -> Option<DagDef> {
    match name {
        "two-step" => Some(two_step()),
        "reviewed-draft" => Some(reviewed_draft()),
        "fan-out" => Some(fan_out()),
        _ => None,
    }
}

fn port(port_type: PortType, required: bool) -> PortDef {
    PortDef {
        port_type,
        required,
        description: None,
        default: None,
    }
}

/// `outline -> draft`: the smallest useful pipeline. The outline block
/// reads `prompt` from the run context and feeds its result downstream.
fn two_step() -> DagDef {
    let mut outline_inputs = BTreeMap::new();
    outline_inputs.insert("prompt".to_owned(), port(PortType::String, true));
    let mut outline_outputs = BTreeMap::new();
    outline_outputs.insert("outline".to_owned(), port(PortType::Json, true));

    let mut draft_inputs = BTreeMap::new();
    draft_inputs.insert("outline".to_owned(), port(PortType::Json, true));
    let mut draft_outputs = BTreeMap::new();
    draft_outputs.insert("draft".to_owned(), port(PortType::String, true));

    DagDef {
        name: "two-step".to_owned(),
        blocks: vec![
            BlockDef {
                id: "outline".to_owned(),
                name: "Outline".to_owned(),
                inputs: outline_inputs,
                outputs: outline_outputs,
                agent: None,
                pre_gates: Vec::new(),
                post_gates: Vec::new(),
                retry: RetrySpec::default(),
                timeout_ms: None,
                approval: None,
                output_schema: None,
            },
            BlockDef {
                id: "draft".to_owned(),
                name: "Draft".to_owned(),
                inputs: draft_inputs,
                outputs: draft_outputs,
                agent: None,
                pre_gates: Vec::new(),
                post_gates: Vec::new(),
                retry: RetrySpec {
                    max_attempts: 1,
                    backoff: BackoffKind::Linear,
                    delay_ms: 250,
                },
                timeout_ms: None,
                approval: None,
                output_schema: None,
            },
        ],
        edges: vec![EdgeDef {
            from_block: "outline".to_owned(),
            from_port: "outline".to_owned(),
            to_block: "draft".to_owned(),
            to_port: "outline".to_owned(),
        }],
    }
}

/// `draft -> publish` with a human approval on the draft and a word-count
/// post-gate, showing the pause/decide flow end to end.
fn reviewed_draft() -> DagDef {
    let mut draft_inputs = BTreeMap::new();
    draft_inputs.insert("prompt".to_owned(), port(PortType::String, true));
    let mut draft_outputs = BTreeMap::new();
    draft_outputs.insert("draft".to_owned(), port(PortType::String, true));

    let mut publish_inputs = BTreeMap::new();
    publish_inputs.insert("draft".to_owned(), port(PortType::String, true));
    let mut publish_outputs = BTreeMap::new();
    publish_outputs.insert("published".to_owned(), port(PortType::Json, true));

    DagDef {
        name: "reviewed-draft".to_owned(),
        blocks: vec![
            BlockDef {
                id: "draft".to_owned(),
                name: "Draft".to_owned(),
                inputs: draft_inputs,
                outputs: draft_outputs,
                agent: None,
                pre_gates: Vec::new(),
                post_gates: vec![GateSpec::WordCount {
                    min: Some(1),
                    max: None,
                }],
                retry: RetrySpec {
                    max_attempts: 2,
                    backoff: BackoffKind::Exponential,
                    delay_ms: 500,
                },
                timeout_ms: None,
                approval: Some(ApprovalSpec {
                    required: true,
                    prompt: "Review the draft before publishing".to_owned(),
                }),
                output_schema: Some(json!({
                    "type": "object",
                    "required": ["draft"],
                    "properties": {"draft": {"type": "string"}}
                })),
            },
            BlockDef {
                id: "publish".to_owned(),
                name: "Publish".to_owned(),
                inputs: publish_inputs,
                outputs: publish_outputs,
                agent: None,
                pre_gates: Vec::new(),
                post_gates: Vec::new(),
                retry: RetrySpec::default(),
                timeout_ms: None,
                approval: None,
                output_schema: None,
            },
        ],
        edges: vec![EdgeDef {
            from_block: "draft".to_owned(),
            from_port: "draft".to_owned(),
            to_block: "publish".to_owned(),
            to_port: "draft".to_owned(),
        }],
    }
}

/// Three independent workers feeding one merge block: the smallest graph
/// that exercises parallel scheduling and fan-in input resolution.
fn fan_out() -> DagDef {
    let worker = |id: &str| {
        let mut inputs = BTreeMap::new();
        inputs.insert("prompt".to_owned(), port(PortType::String, true));
        let mut outputs = BTreeMap::new();
        outputs.insert("part".to_owned(), port(PortType::Json, true));
        BlockDef {
            id: id.to_owned(),
            name: id.to_owned(),
            inputs,
            outputs,
            agent: None,
            pre_gates: Vec::new(),
            post_gates: Vec::new(),
            retry: RetrySpec::default(),
            timeout_ms: None,
            approval: None,
            output_schema: None,
        }
    };

    let mut merge_inputs = BTreeMap::new();
    for port_name in ["left", "middle", "right"] {
        merge_inputs.insert(port_name.to_owned(), port(PortType::Json, true));
    }
    let mut merge_outputs = BTreeMap::new();
    merge_outputs.insert("merged".to_owned(), port(PortType::Json, true));

    let edge = |from: &str, to_port: &str| EdgeDef {
        from_block: from.to_owned(),
        from_port: "part".to_owned(),
        to_block: "merge".to_owned(),
        to_port: to_port.to_owned(),
    };

    DagDef {
        name: "fan-out".to_owned(),
        blocks: vec![
            worker("left"),
            worker("middle"),
            worker("right"),
            BlockDef {
                id: "merge".to_owned(),
                name: "Merge".to_owned(),
                inputs: merge_inputs,
                outputs: merge_outputs,
                agent: None,
                pre_gates: Vec::new(),
                post_gates: Vec::new(),
                retry: RetrySpec::default(),
                timeout_ms: None,
                approval: None,
                output_schema: None,
            },
        ],
        edges: vec![
            edge("left", "left"),
            edge("middle", "middle"),
            edge("right", "right"),
        ],
    }
}
