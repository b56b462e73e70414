//! `arbor events`: print a run's durable event log.

use anyhow::Result;

use arbor_core::engine::Engine;

pub async fn show_events(engine: &Engine, run_id: &str, since: i64) -> Result<()> {
    let (events, next_since) = engine
        .replay(run_id, since)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    if events.is_empty() {
        println!("no events after sequence {since}");
        return Ok(());
    }

    for event in &events {
        let block = event
            .block_id
            .as_deref()
            .map(|b| format!(" {b}"))
            .unwrap_or_default();
        println!(
            "[{}] {} {}{block}",
            event.seq,
            event.timestamp.format("%H:%M:%S%.3f"),
            event.event_type,
        );
        if let Some(reason) = event.data.get("reason").and_then(|v| v.as_str()) {
            println!("      reason: {reason}");
        }
    }
    println!("next_since: {next_since}");
    Ok(())
}
