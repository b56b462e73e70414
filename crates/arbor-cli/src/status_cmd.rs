//! `arbor status`: list recent runs, or show one run in detail.

use anyhow::Result;
use serde_json::Value;

use arbor_core::engine::Engine;

pub async fn show_status(engine: &Engine, run_id: Option<&str>) -> Result<()> {
    match run_id {
        Some(run_id) => show_one(engine, run_id).await,
        None => list_recent(engine).await,
    }
}

async fn list_recent(engine: &Engine) -> Result<()> {
    let (rows, total) = engine
        .list_runs(None, 20, 0)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    if rows.is_empty() {
        println!("no runs recorded");
        return Ok(());
    }

    println!("{total} run(s), newest first:");
    for row in rows {
        let live = if engine.is_active(&row.id) { " (live)" } else { "" };
        println!(
            "  {}  {:<16} {:<15} {}{live}",
            row.id,
            row.dag_name,
            row.status.to_string(),
            row.updated_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

async fn show_one(engine: &Engine, run_id: &str) -> Result<()> {
    let view = engine
        .run_state(run_id)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    println!("run {run_id}: {}", view.status);
    if let Some(blocks) = view.run.get("blocks").and_then(Value::as_object) {
        for (block_id, instance) in blocks {
            let status = instance["status"].as_str().unwrap_or("?");
            let attempt = instance["retry_state"]["attempt"].as_u64().unwrap_or(0);
            println!("  {block_id}: {status} (attempt {attempt})");
        }
    }
    if let Some(approval) = &view.approval {
        println!(
            "pending approval on {:?}: {}",
            approval["block_id"].as_str().unwrap_or("?"),
            approval["prompt"].as_str().unwrap_or(""),
        );
        println!("  token: {}", approval["token"].as_str().unwrap_or("?"));
    }
    println!("{} event(s) recorded", view.events.len());
    Ok(())
}
