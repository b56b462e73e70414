//! The admission pump.
//!
//! A single-flight loop that drains the durable queue into the executor
//! whenever capacity frees up. Triggers: enqueue, run completion/failure,
//! startup, and a periodic tick that doubles as the stall catch-all. The
//! queue claim transaction (see `arbor_db::queries::queue::claim_next`) is
//! the serialization point: a run is admitted at most once even under
//! concurrent pumps.

use std::sync::Arc;
use std::time::Duration;

use arbor_db::models::QueueStatus;
use arbor_db::queries::queue as queue_db;

use crate::engine::EngineInner;
use crate::run::StartRequest;

pub(crate) async fn pump_loop(inner: Arc<EngineInner>) {
    let tick = Duration::from_millis(inner.limits.queue_lease_ms.max(1_000));
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.pump.notified() => {}
            _ = tokio::time::sleep(tick) => {}
        }
        drain(&inner).await;
    }
}

/// Claim and start queued runs until the queue is empty or the concurrency
/// cap is reached again.
async fn drain(inner: &Arc<EngineInner>) {
    loop {
        if inner.active_count() >= inner.limits.max_concurrent_runs {
            return;
        }

        let claimed = match queue_db::claim_next(
            &inner.pool,
            &inner.owner,
            inner.limits.queue_lease_ms as i64,
        )
        .await
        {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "queue claim failed");
                return;
            }
        };

        let run_id = claimed.run_id.clone();
        tracing::info!(
            run_id = %run_id,
            attempt = claimed.attempt,
            "claimed queued run"
        );

        let req: StartRequest = match serde_json::from_str(&claimed.payload_json) {
            Ok(req) => req,
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "unreadable queue payload");
                let _ = queue_db::mark_terminal(
                    &inner.pool,
                    &run_id,
                    QueueStatus::Failed,
                    Some(&format!("unreadable payload: {e}")),
                )
                .await;
                continue;
            }
        };

        // The claim already serialized admission; reuse the queued run id so
        // the snapshot row and the executor share one identity.
        match inner
            .clone()
            .submit_internal(req, Some(run_id.clone()), true)
            .await
        {
            Ok(_) => {
                if let Err(e) = queue_db::mark_running(
                    &inner.pool,
                    &run_id,
                    &inner.owner,
                    &claimed.claim_token,
                    inner.limits.queue_lease_ms as i64,
                )
                .await
                {
                    tracing::warn!(run_id = %run_id, error = %e, "failed to mark queue entry running");
                }
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "failed to start queued run");
                let _ = queue_db::mark_terminal(
                    &inner.pool,
                    &run_id,
                    QueueStatus::Failed,
                    Some(&e.to_string()),
                )
                .await;
            }
        }
    }
}
