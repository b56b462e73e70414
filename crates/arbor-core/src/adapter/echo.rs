//! The dev-mode echo adapter.
//!
//! Backs `devMode` start requests and local smoke tests: it never calls a
//! real provider, completes instantly, and -- when the block declares an
//! output schema -- synthesizes a minimal conforming value so contract
//! checks pass.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use super::{DispatchOutcome, DispatchRequest, ProviderAdapter};

#[derive(Debug, Clone, Default)]
pub struct EchoAdapter;

#[async_trait]
impl ProviderAdapter for EchoAdapter {
    fn name(&self) -> &str {
        "echo"
    }

    async fn dispatch(
        &self,
        request: &DispatchRequest,
        cancel: CancellationToken,
    ) -> Result<DispatchOutcome> {
        if cancel.is_cancelled() {
            return Ok(DispatchOutcome::err("cancelled before dispatch"));
        }

        let output = match &request.output_schema {
            Some(schema) => synthesize(schema).to_string(),
            None => json!({
                "echo": request.description,
                "title": request.title,
                "bounce_count": request.bounce_count,
            })
            .to_string(),
        };

        Ok(DispatchOutcome {
            success: true,
            output: Some(output),
            tokens_used: Some(0),
            error: None,
            actual_provider: Some("echo".to_owned()),
            actual_model: None,
        })
    }
}

/// Build a minimal value conforming to the schema subset.
fn synthesize(schema: &Value) -> Value {
    let inferred = schema
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| {
            if schema.get("properties").is_some() || schema.get("required").is_some() {
                Some("object".to_owned())
            } else {
                None
            }
        });

    match inferred.as_deref() {
        Some("string") => json!("echo"),
        Some("number") => json!(0),
        Some("boolean") => json!(false),
        Some("null") | None => Value::Null,
        Some("array") => Value::Array(Vec::new()),
        Some("object") => {
            let mut out = Map::new();
            let properties = schema.get("properties").and_then(Value::as_object);
            if let Some(required) = schema.get("required").and_then(Value::as_array) {
                for name in required.iter().filter_map(Value::as_str) {
                    let prop_schema = properties
                        .and_then(|p| p.get(name))
                        .cloned()
                        .unwrap_or(Value::Null);
                    out.insert(name.to_owned(), synthesize(&prop_schema));
                }
            }
            Value::Object(out)
        }
        Some(_) => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::schema::validate_value;

    fn request(output_schema: Option<Value>) -> DispatchRequest {
        DispatchRequest {
            title: "t".into(),
            description: "do the thing".into(),
            context: json!({}),
            acceptance_criteria: Vec::new(),
            bounce_count: 0,
            agent: None,
            system: None,
            output_schema,
            model: None,
            deadline: None,
        }
    }

    #[tokio::test]
    async fn echoes_description_without_schema() {
        let outcome = EchoAdapter
            .dispatch(&request(None), CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success);
        let value: Value = serde_json::from_str(outcome.output.as_deref().unwrap()).unwrap();
        assert_eq!(value["echo"], "do the thing");
    }

    #[tokio::test]
    async fn synthesized_output_conforms_to_schema() {
        let schema = json!({
            "type": "object",
            "required": ["title", "count", "tags"],
            "properties": {
                "title": {"type": "string"},
                "count": {"type": "number"},
                "tags": {"type": "array"}
            }
        });
        let outcome = EchoAdapter
            .dispatch(&request(Some(schema.clone())), CancellationToken::new())
            .await
            .unwrap();
        let value: Value = serde_json::from_str(outcome.output.as_deref().unwrap()).unwrap();
        assert!(validate_value(&schema, &value).is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = EchoAdapter
            .dispatch(&request(None), cancel)
            .await
            .unwrap();
        assert!(!outcome.success);
    }
}
