//! Structural validation of parsed model output.
//!
//! A failed validation is a soft signal for the orchestrator's retry decision,
//! never an error: `validate` always returns an outcome.

use std::fmt::Debug;

use serde::Serialize;
use serde_json::Value;

use crate::llm_client::prompts::SCHEMA_DESCRIPTION_HEADER;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: vec![],
        }
    }

    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// `(data) -> {valid, errors}`. Implementations must not panic.
pub trait SchemaValidator: Send + Sync + Debug {
    fn validate(&self, data: &Value) -> ValidationOutcome;
}

/// Validator over a JSON-Schema subset: `type`, `properties`, `required`,
/// `items`, `enum`, `minItems`, `minLength`. Unknown keywords are ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuralSchema {
    schema: Value,
}

impl StructuralSchema {
    pub fn new(schema: Value) -> Self {
        Self { schema }
    }

    /// Machine-readable description appended to prompts on the first turn.
    pub fn describe(&self) -> String {
        let rendered =
            serde_json::to_string_pretty(&self.schema).unwrap_or_else(|_| self.schema.to_string());
        format!("{SCHEMA_DESCRIPTION_HEADER}\n{rendered}")
    }
}

impl SchemaValidator for StructuralSchema {
    fn validate(&self, data: &Value) -> ValidationOutcome {
        let mut errors = Vec::new();
        check(&self.schema, data, "$", &mut errors);
        ValidationOutcome::from_errors(errors)
    }
}

/// Appends the schema description unless the prompt already carries one.
pub fn append_schema_description(prompt: &str, schema: &StructuralSchema) -> String {
    if prompt.contains(SCHEMA_DESCRIPTION_HEADER) {
        return prompt.to_string();
    }
    format!("{}\n\n{}", prompt.trim_end(), schema.describe())
}

fn check(schema: &Value, data: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => items.iter().filter_map(|t| t.as_str()).collect(),
            _ => vec![],
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| matches_type(t, data)) {
            errors.push(format!(
                "{path}: expected {}, found {}",
                allowed.join(" | "),
                type_name(data)
            ));
            // Nested keywords are meaningless against the wrong type.
            return;
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.contains(data) {
            errors.push(format!("{path}: value {data} is not one of the allowed values"));
        }
    }

    match data {
        Value::Object(map) => {
            if let Some(Value::Array(required)) = schema.get("required") {
                for key in required.iter().filter_map(|k| k.as_str()) {
                    if !map.contains_key(key) {
                        errors.push(format!("{path}: missing required property '{key}'"));
                    }
                }
            }
            if let Some(Value::Object(properties)) = schema.get("properties") {
                for (key, sub_schema) in properties {
                    if let Some(value) = map.get(key) {
                        check(sub_schema, value, &format!("{path}.{key}"), errors);
                    }
                }
            }
        }
        Value::Array(items) => {
            if let Some(min) = schema.get("minItems").and_then(|m| m.as_u64()) {
                if (items.len() as u64) < min {
                    errors.push(format!(
                        "{path}: expected at least {min} items, found {}",
                        items.len()
                    ));
                }
            }
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{path}[{i}]"), errors);
                }
            }
        }
        Value::String(s) => {
            if let Some(min) = schema.get("minLength").and_then(|m| m.as_u64()) {
                if (s.chars().count() as u64) < min {
                    errors.push(format!("{path}: shorter than {min} characters"));
                }
            }
        }
        _ => {}
    }
}

fn matches_type(expected: &str, data: &Value) -> bool {
    match expected {
        "object" => data.is_object(),
        "array" => data.is_array(),
        "string" => data.is_string(),
        "boolean" => data.is_boolean(),
        "null" => data.is_null(),
        "number" => data.is_number(),
        "integer" => {
            data.is_i64() || data.is_u64() || data.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false)
        }
        _ => true,
    }
}

fn type_name(data: &Value) -> &'static str {
    match data {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
