//! One-shot execution: start a DAG and stream its events to the terminal
//! until it settles.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value, json};

use arbor_core::engine::Engine;
use arbor_core::run::StartRequest;

/// Parse `key=value` pairs into a context map. Values that parse as JSON
/// are kept structured; everything else is a string.
fn parse_context(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut context = Map::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("context entry {pair:?} is not key=value"))?;
        let parsed = serde_json::from_str(value).unwrap_or_else(|_| json!(value));
        context.insert(key.to_owned(), parsed);
    }
    Ok(context)
}

pub async fn run_dag(
    engine: &Engine,
    dag_file: Option<&Path>,
    example: Option<&str>,
    context_pairs: &[String],
    dev: bool,
) -> Result<()> {
    let dag = match (dag_file, example) {
        (Some(path), None) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Some(serde_json::from_str(&raw).with_context(|| {
                format!("{} is not valid JSON", path.display())
            })?)
        }
        (None, Some(_)) => None,
        (Some(_), Some(_)) => bail!("pass either a dag file or --example, not both"),
        (None, None) => bail!("pass a dag file or --example <name>"),
    };

    let req = StartRequest {
        dag,
        example: example.map(str::to_owned),
        context: Some(parse_context(context_pairs)?),
        dev_mode: dev,
        ..Default::default()
    };

    engine.start_background();
    let submission = engine.submit(req).await.map_err(|e| anyhow::anyhow!(e))?;
    println!("run {} started ({} blocks)", submission.run_id, submission.blocks.len());

    // Stream events until the run settles.
    let mut events = engine.subscribe(&submission.run_id, "cli");
    while let Some(event) = events.recv().await {
        match event.block_id.as_deref() {
            Some(block_id) => println!("  [{}] {} {}", event.seq, event.event_type, block_id),
            None => println!("  [{}] {}", event.seq, event.event_type),
        }
        if event.event_type.is_run_terminal() {
            break;
        }
    }

    let view = engine
        .run_state(&submission.run_id)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    println!("run {} finished: {}", submission.run_id, view.status);

    if let Some(blocks) = view.run.get("blocks").and_then(Value::as_object) {
        for (block_id, instance) in blocks {
            let status = instance["status"].as_str().unwrap_or("?");
            match instance.get("error") {
                Some(error) if !error.is_null() => {
                    println!(
                        "  {block_id}: {status} ({}: {})",
                        error["code"].as_str().unwrap_or("?"),
                        error["message"].as_str().unwrap_or("?")
                    );
                }
                _ => println!("  {block_id}: {status}"),
            }
        }
    }

    Ok(())
}
