//! Live event fan-out.
//!
//! A per-run map of subscribers keyed by client id. Registering the same
//! client id twice evicts the older handler, so a reconnecting SSE client
//! never receives duplicates. Sends are best-effort over bounded channels:
//! a slow client drops events rather than blocking the executor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::event::RunEvent;

/// Buffered events per subscriber before drops set in.
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<HashMap<String, HashMap<String, mpsc::Sender<RunEvent>>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for a run. An existing handler with the same
    /// client id is evicted (its receiver closes).
    pub fn subscribe(&self, run_id: &str, client_id: &str) -> mpsc::Receiver<RunEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let handlers = inner.entry(run_id.to_owned()).or_default();
        if handlers.insert(client_id.to_owned(), tx).is_some() {
            tracing::debug!(run_id, client_id, "evicted existing subscriber");
        }
        rx
    }

    /// Remove one subscriber.
    pub fn unsubscribe(&self, run_id: &str, client_id: &str) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        if let Some(handlers) = inner.get_mut(run_id) {
            handlers.remove(client_id);
            if handlers.is_empty() {
                inner.remove(run_id);
            }
        }
    }

    /// Broadcast an event to every subscriber of its run. Closed receivers
    /// are pruned; full buffers drop the event for that client.
    pub fn publish(&self, event: &RunEvent) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let Some(handlers) = inner.get_mut(&event.run_id) else {
            return;
        };
        handlers.retain(|client_id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(
                    run_id = %event.run_id,
                    client_id,
                    "subscriber buffer full, dropping event"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if handlers.is_empty() {
            inner.remove(&event.run_id);
        }
    }

    /// Drop all subscribers of a run (their streams end).
    pub fn close_run(&self, run_id: &str) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        inner.remove(run_id);
    }

    /// Number of live subscribers for a run.
    pub fn subscriber_count(&self, run_id: &str) -> usize {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        inner.get(run_id).map(HashMap::len).unwrap_or(0)
    }
}
