//! Rebuilding run state by folding events over a stored base run.
//!
//! Block events carry the full instance snapshot, so the fold overwrites
//! `blocks[block_id]` wholesale. Run status derives from the last terminal
//! event, with approval events toggling the paused state in between.

use arbor_db::models::RunStatus;

use crate::event::{EventType, RunEvent};
use crate::run::Run;

/// Apply a single event to a run in place.
pub fn apply_event(run: &mut Run, event: &RunEvent) {
    match event.event_type {
        EventType::RunStart => {
            if !run.status.is_terminal() {
                run.status = RunStatus::Running;
            }
        }
        EventType::BlockStart | EventType::BlockComplete | EventType::BlockFail => {
            let Some(block_id) = event.block_id.as_deref() else {
                return;
            };
            if let Some(instance) = event
                .data
                .get("instance")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
            {
                run.blocks.insert(block_id.to_owned(), instance);
            }
        }
        EventType::ApprovalRequested => {
            if !run.status.is_terminal() {
                run.status = RunStatus::PausedApproval;
            }
        }
        EventType::ApprovalDecided => {
            if run.status == RunStatus::PausedApproval {
                run.status = RunStatus::Running;
            }
        }
        EventType::RunComplete => run.status = RunStatus::Completed,
        EventType::RunFail => {
            // `run:fail` covers both failure and cancellation; the reason
            // code distinguishes them. TIMEOUT is the run-duration cap,
            // which the executor settles as a cancellation.
            let code = event.data.get("code").and_then(|v| v.as_str());
            run.status = match code {
                Some("CANCELLED") | Some("STALL_TIMEOUT") | Some("TIMEOUT") => {
                    RunStatus::Cancelled
                }
                _ => RunStatus::Failed,
            };
        }
        EventType::RunIterated => run.status = RunStatus::Iterated,
    }
    if event.timestamp > run.updated_at {
        run.updated_at = event.timestamp;
    }
}

/// Fold a sequence of events (ascending `seq`) over a base run.
pub fn rebuild(mut base: Run, events: &[RunEvent]) -> Run {
    for event in events {
        apply_event(&mut base, event);
    }
    base
}
