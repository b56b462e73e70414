//! Live run events over SSE.
//!
//! Frames carry the event sequence as the SSE `id`, so a reconnecting
//! client resumes with `Last-Event-ID` and replays only what it missed.
//! The `x-sse-client-id` header dedupes handlers: a client reconnecting
//! under the same id evicts its previous stream.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde::Deserialize;
use uuid::Uuid;

use arbor_core::event::RunEvent;

use crate::serve_cmd::{AppError, AppState};

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub since: Option<i64>,
}

/// `GET /api/dag/runs/{id}/events`.
pub async fn stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let since = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .or(params.since)
        .unwrap_or(0);

    let client_id = headers
        .get("x-sse-client-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Subscribe before replaying so nothing falls in the gap; duplicates
    // across the seam are dropped by sequence below.
    let mut live = state.engine.subscribe(&id, &client_id);
    let active = state.engine.is_active(&id);
    // A 404 here drops `live`, which unregisters the subscription.
    let (replayed, _) = state.engine.replay(&id, since).await?;

    let stream = async_stream::stream! {
        let mut last_seq = since;
        let mut terminal_seen = false;

        for event in replayed {
            last_seq = event.seq;
            terminal_seen = event.event_type.is_run_terminal();
            yield Ok(frame(&event));
            if terminal_seen {
                break;
            }
        }

        if terminal_seen || !active {
            // Run is settled (or was never live here): final keepalive and
            // close.
            yield Ok(Event::default().comment("stream closed"));
            return;
        }

        while let Some(event) = live.recv().await {
            // Drop anything already delivered by the replay.
            if event.seq != 0 && event.seq <= last_seq {
                continue;
            }
            last_seq = event.seq;
            let terminal = event.event_type.is_run_terminal();
            yield Ok(frame(&event));
            if terminal {
                yield Ok(Event::default().comment("stream closed"));
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

fn frame(event: &RunEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_owned());
    Event::default()
        .id(event.seq.to_string())
        .event(event.event_type.as_str())
        .data(data)
}
