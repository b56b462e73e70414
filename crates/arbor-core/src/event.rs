//! Typed run events and the persist-then-fan-out emitter.
//!
//! Events are append-only and carry a store-assigned monotonic sequence.
//! Block events embed the full instance snapshot so a run can be rebuilt by
//! folding its events over the stored base run (see [`crate::replay`]).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::SqlitePool;

use arbor_db::models::EventRow;
use arbor_db::queries::events as event_db;

use crate::approval::ApprovalRequest;
use crate::bus::EventBus;
use crate::run::BlockInstance;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// The wire taxonomy of run events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "run:start")]
    RunStart,
    #[serde(rename = "block:start")]
    BlockStart,
    #[serde(rename = "block:complete")]
    BlockComplete,
    #[serde(rename = "block:fail")]
    BlockFail,
    #[serde(rename = "approval:requested")]
    ApprovalRequested,
    #[serde(rename = "approval:decided")]
    ApprovalDecided,
    #[serde(rename = "run:complete")]
    RunComplete,
    #[serde(rename = "run:fail")]
    RunFail,
    #[serde(rename = "run:iterated")]
    RunIterated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStart => "run:start",
            Self::BlockStart => "block:start",
            Self::BlockComplete => "block:complete",
            Self::BlockFail => "block:fail",
            Self::ApprovalRequested => "approval:requested",
            Self::ApprovalDecided => "approval:decided",
            Self::RunComplete => "run:complete",
            Self::RunFail => "run:fail",
            Self::RunIterated => "run:iterated",
        }
    }

    /// Terminal events end the run's live stream.
    pub fn is_run_terminal(&self) -> bool {
        matches!(self, Self::RunComplete | Self::RunFail | Self::RunIterated)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run:start" => Ok(Self::RunStart),
            "block:start" => Ok(Self::BlockStart),
            "block:complete" => Ok(Self::BlockComplete),
            "block:fail" => Ok(Self::BlockFail),
            "approval:requested" => Ok(Self::ApprovalRequested),
            "approval:decided" => Ok(Self::ApprovalDecided),
            "run:complete" => Ok(Self::RunComplete),
            "run:fail" => Ok(Self::RunFail),
            "run:iterated" => Ok(Self::RunIterated),
            other => Err(EventTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EventType`] string.
#[derive(Debug, Clone)]
pub struct EventTypeParseError(pub String);

impl fmt::Display for EventTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid event type: {:?}", self.0)
    }
}

impl std::error::Error for EventTypeParseError {}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One immutable event. `seq` is 0 until the store assigns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub seq: i64,
    pub run_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    fn new(run_id: &str, event_type: EventType, block_id: Option<&str>, data: Value) -> Self {
        Self {
            seq: 0,
            run_id: run_id.to_owned(),
            event_type,
            block_id: block_id.map(str::to_owned),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn run_start(run_id: &str, dag_name: &str, block_count: usize) -> Self {
        Self::new(
            run_id,
            EventType::RunStart,
            None,
            json!({"dag_name": dag_name, "block_count": block_count}),
        )
    }

    pub fn block_start(run_id: &str, block_id: &str, instance: &BlockInstance) -> Self {
        Self::new(
            run_id,
            EventType::BlockStart,
            Some(block_id),
            json!({"instance": instance}),
        )
    }

    pub fn block_complete(run_id: &str, block_id: &str, instance: &BlockInstance) -> Self {
        Self::new(
            run_id,
            EventType::BlockComplete,
            Some(block_id),
            json!({"instance": instance}),
        )
    }

    pub fn block_fail(run_id: &str, block_id: &str, instance: &BlockInstance) -> Self {
        Self::new(
            run_id,
            EventType::BlockFail,
            Some(block_id),
            json!({"instance": instance}),
        )
    }

    pub fn approval_requested(run_id: &str, request: &ApprovalRequest) -> Self {
        Self::new(
            run_id,
            EventType::ApprovalRequested,
            Some(&request.block_id),
            json!({"approval": request}),
        )
    }

    pub fn approval_decided(run_id: &str, block_id: &str, decision: &str, notes: Option<&str>) -> Self {
        Self::new(
            run_id,
            EventType::ApprovalDecided,
            Some(block_id),
            json!({"decision": decision, "notes": notes}),
        )
    }

    pub fn run_complete(run_id: &str) -> Self {
        Self::new(run_id, EventType::RunComplete, None, json!({}))
    }

    pub fn run_fail(run_id: &str, reason: &str, code: &str) -> Self {
        Self::new(
            run_id,
            EventType::RunFail,
            None,
            json!({"reason": reason, "code": code}),
        )
    }

    pub fn run_iterated(run_id: &str, iterated_run_id: &str, cycle: u32) -> Self {
        Self::new(
            run_id,
            EventType::RunIterated,
            None,
            json!({"iterated_run_id": iterated_run_id, "cycle": cycle}),
        )
    }

    /// Decode a stored row back into a typed event.
    pub fn from_row(row: &EventRow) -> Option<Self> {
        let event_type = row.event_type.parse().ok()?;
        Some(Self {
            seq: row.id,
            run_id: row.run_id.clone(),
            event_type,
            block_id: row.block_id.clone(),
            data: serde_json::from_str(&row.data_json).unwrap_or(Value::Null),
            timestamp: row.timestamp,
        })
    }
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

/// Persists events and fans them out to live subscribers.
///
/// Event writes are best-effort: a persistence failure is logged and the
/// event still reaches subscribers (with `seq` 0); it must never abort a
/// run.
#[derive(Clone)]
pub struct EventEmitter {
    pool: SqlitePool,
    bus: EventBus,
}

impl EventEmitter {
    pub fn new(pool: SqlitePool, bus: EventBus) -> Self {
        Self { pool, bus }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Append the event, write the assigned sequence back onto it, then
    /// broadcast. Returns the event as broadcast.
    pub async fn emit(&self, mut event: RunEvent) -> RunEvent {
        let data_json = event.data.to_string();
        let new_event = event_db::NewEvent {
            run_id: &event.run_id,
            event_type: event.event_type.as_str(),
            block_id: event.block_id.as_deref(),
            data_json: &data_json,
            timestamp: event.timestamp,
        };

        match event_db::append_event(&self.pool, &new_event).await {
            Ok(seq) => event.seq = seq,
            Err(e) => {
                tracing::warn!(
                    run_id = %event.run_id,
                    event_type = %event.event_type,
                    error = %e,
                    "failed to persist event (best-effort)"
                );
            }
        }

        self.bus.publish(&event);
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_display_roundtrip() {
        let variants = [
            EventType::RunStart,
            EventType::BlockStart,
            EventType::BlockComplete,
            EventType::BlockFail,
            EventType::ApprovalRequested,
            EventType::ApprovalDecided,
            EventType::RunComplete,
            EventType::RunFail,
            EventType::RunIterated,
        ];
        for v in &variants {
            let s = v.as_str();
            let parsed: EventType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn event_type_serde_uses_colon_names() {
        let json = serde_json::to_string(&EventType::BlockComplete).unwrap();
        assert_eq!(json, "\"block:complete\"");
    }

    #[test]
    fn terminal_classification() {
        assert!(EventType::RunComplete.is_run_terminal());
        assert!(EventType::RunFail.is_run_terminal());
        assert!(EventType::RunIterated.is_run_terminal());
        assert!(!EventType::BlockComplete.is_run_terminal());
    }

    #[test]
    fn event_type_invalid() {
        assert!("run:pause".parse::<EventType>().is_err());
    }
}
