//! JSON-schema-subset validation with canonical path reporting.
//!
//! The subset understands `type`, `required`, `properties`, and `items`.
//! Paths are reported the way retry feedback renders them: `$` for a root
//! mismatch, dotted keys for nested objects (`user.age`), and numeric
//! segments for array indices (`items.1.id`).

use serde_json::Value;

/// A single schema violation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl Violation {
    fn new(path: &[String], message: impl Into<String>) -> Self {
        Self {
            path: render_path(path),
            message: message.into(),
        }
    }
}

/// The safe-parse interface for programmatic schemas. JSON schemas coming in
/// over the wire use the [`Value`] impl; embedders can plug their own typed
/// schema objects.
pub trait TypedSchema: Send + Sync {
    fn safe_parse(&self, value: &Value) -> Result<(), Vec<Violation>>;
}

impl TypedSchema for Value {
    fn safe_parse(&self, value: &Value) -> Result<(), Vec<Violation>> {
        let violations = validate_value(self, value);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

/// Validate `value` against the schema subset, returning every violation.
pub fn validate_value(schema: &Value, value: &Value) -> Vec<Violation> {
    let mut path = Vec::new();
    let mut out = Vec::new();
    check(schema, value, &mut path, &mut out);
    out
}

fn render_path(path: &[String]) -> String {
    if path.is_empty() {
        "$".to_owned()
    } else {
        path.join(".")
    }
}

/// The effective type of a schema node. When `type` is absent but
/// `properties` or `required` is present, the schema is treated as an
/// object schema.
fn effective_type(schema: &Value) -> Option<String> {
    if let Some(t) = schema.get("type").and_then(Value::as_str) {
        return Some(t.to_owned());
    }
    if schema.get("properties").is_some() || schema.get("required").is_some() {
        return Some("object".to_owned());
    }
    None
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        // Unknown type names never match; the violation text carries them.
        _ => false,
    }
}

fn check(schema: &Value, value: &Value, path: &mut Vec<String>, out: &mut Vec<Violation>) {
    let expected = match effective_type(schema) {
        Some(t) => t,
        // A schema with no recognizable constraints accepts anything.
        None => return,
    };

    if !type_matches(&expected, value) {
        out.push(Violation::new(
            path,
            format!("expected {expected}, got {}", type_name(value)),
        ));
        return;
    }

    match value {
        Value::Object(map) => {
            // `null` counts as present for `required`; a missing key is
            // absent. One violation per missing property.
            if let Some(required) = schema.get("required").and_then(Value::as_array) {
                for name in required.iter().filter_map(Value::as_str) {
                    if !map.contains_key(name) {
                        path.push(name.to_owned());
                        out.push(Violation::new(path, "missing required property"));
                        path.pop();
                    }
                }
            }

            if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
                for (name, prop_schema) in properties {
                    if let Some(prop_value) = map.get(name) {
                        path.push(name.clone());
                        check(prop_schema, prop_value, path, out);
                        path.pop();
                    }
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (index, item) in items.iter().enumerate() {
                    path.push(index.to_string());
                    check(item_schema, item, path, out);
                    path.pop();
                }
            }
        }
        _ => {}
    }
}
