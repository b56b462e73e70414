//! The provider adapter seam -- the interface blocks dispatch through.
//!
//! Concrete adapters (subprocess CLIs, HTTP endpoints) live outside the
//! engine; the core ships the trait, a registry, and a dev-mode echo
//! adapter.

mod echo;
mod registry;

pub use echo::EchoAdapter;
pub use registry::AdapterRegistry;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// A unit of work handed to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub title: String,
    pub description: String,
    /// Public run context plus resolved inputs.
    pub context: Value,
    pub acceptance_criteria: Vec<String>,
    /// Number of prior attempts for this block (0 on the first try).
    pub bounce_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Remaining wall-clock budget for this attempt.
    #[serde(skip)]
    pub deadline: Option<Duration>,
}

/// What a provider reports back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_model: Option<String>,
}

impl DispatchOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Incremental output from a streaming dispatch.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// A piece of provider output text.
    Output(String),
    /// Token usage reported mid-flight.
    TokensUsed(u64),
}

/// Callbacks for [`ProviderAdapter::dispatch_stream`].
pub struct StreamHandlers {
    pub on_chunk: Box<dyn FnMut(StreamChunk) + Send>,
}

impl StreamHandlers {
    pub fn new(on_chunk: impl FnMut(StreamChunk) + Send + 'static) -> Self {
        Self {
            on_chunk: Box::new(on_chunk),
        }
    }
}

/// Adapter interface for dispatching block work to a provider.
///
/// Implementations are expected to be best-effort idempotent: the engine
/// retries failed dispatches and may abort in-flight ones through the
/// cancellation token.
///
/// # Object Safety
///
/// Object-safe so adapters can be stored as `Arc<dyn ProviderAdapter>` in
/// the [`AdapterRegistry`].
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Registry name for this adapter (e.g. "echo", "shell", "http").
    fn name(&self) -> &str;

    /// Execute one dispatch. Honors `cancel` as a best-effort abort signal.
    async fn dispatch(
        &self,
        request: &DispatchRequest,
        cancel: CancellationToken,
    ) -> Result<DispatchOutcome>;

    /// Streaming dispatch for adapters that can surface incremental
    /// output. The default buffers a plain `dispatch` and emits it as a
    /// single chunk, so implementors only override when they have a real
    /// stream.
    async fn dispatch_stream(
        &self,
        request: &DispatchRequest,
        mut handlers: StreamHandlers,
        cancel: CancellationToken,
    ) -> Result<DispatchOutcome> {
        let outcome = self.dispatch(request, cancel).await?;
        if let Some(output) = &outcome.output {
            (handlers.on_chunk)(StreamChunk::Output(output.clone()));
        }
        if let Some(tokens) = outcome.tokens_used {
            (handlers.on_chunk)(StreamChunk::TokensUsed(tokens));
        }
        Ok(outcome)
    }

    /// Liveness probe; defaults to healthy.
    async fn health_check(&self) -> bool {
        true
    }
}

// Compile-time assertion: ProviderAdapter must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn ProviderAdapter) {}
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc as StdArc, Mutex};

    #[tokio::test]
    async fn default_stream_emits_buffered_output() {
        let chunks: StdArc<Mutex<Vec<StreamChunk>>> = StdArc::new(Mutex::new(Vec::new()));
        let sink = chunks.clone();
        let handlers = StreamHandlers::new(move |chunk| {
            sink.lock().unwrap().push(chunk);
        });

        let request = DispatchRequest {
            title: "t".into(),
            description: "stream me".into(),
            context: serde_json::json!({}),
            acceptance_criteria: Vec::new(),
            bounce_count: 0,
            agent: None,
            system: None,
            output_schema: None,
            model: None,
            deadline: None,
        };

        let outcome = EchoAdapter
            .dispatch_stream(&request, handlers, tokio_util::sync::CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success);

        let chunks = chunks.lock().unwrap();
        assert!(
            chunks
                .iter()
                .any(|c| matches!(c, StreamChunk::Output(text) if text.contains("stream me")))
        );
        assert!(chunks.iter().any(|c| matches!(c, StreamChunk::TokensUsed(_))));
    }
}
