//! `arbor queue`: show the admission queue in claim order.

use anyhow::Result;

use arbor_core::engine::Engine;
use arbor_db::models::Priority;

pub async fn show_queue(engine: &Engine) -> Result<()> {
    let entries = engine
        .queue_entries()
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    if entries.is_empty() {
        println!("queue is empty");
        return Ok(());
    }

    println!("{} entr(ies):", entries.len());
    for entry in entries {
        let rank = entry
            .manual_rank
            .map(|r| format!("#{r}"))
            .unwrap_or_else(|| "-".to_owned());
        println!(
            "  {}  {:<10} {:<4} rank {:<5} attempt {}  {}",
            entry.run_id,
            entry.status.to_string(),
            Priority::from_weight(entry.priority).to_string(),
            rank,
            entry.attempt,
            entry
                .last_error
                .as_deref()
                .unwrap_or(""),
        );
    }
    Ok(())
}
