//! Structural check of a (possibly transformed) payload.

use crate::error::{PayloadOrigin, PipelineError};
use crate::types::TransformedEvent;
use serde_json::Value;

const REQUIRED: &[&str] = &["messageId", "event"];
const OPTIONAL: &[&str] = &["timestamp", "reason", "error"];

/// Validate `payload` and return the typed event. Extra keys pass through
/// unchecked. Only the first failing field is reported.
pub fn validate_event(payload: &Value, origin: PayloadOrigin) -> Result<TransformedEvent, PipelineError> {
    let fail = |detail: String| PipelineError::InvalidEvent { origin, detail };

    let obj = payload.as_object().ok_or_else(|| {
        fail(format!("(root): Expected object, received {}", type_name(payload)))
    })?;

    for key in REQUIRED {
        match obj.get(*key) {
            None => return Err(fail(format!("{key}: Required"))),
            Some(Value::String(_)) => {}
            Some(other) => {
                return Err(fail(format!(
                    "{key}: Expected string, received {}",
                    type_name(other)
                )))
            }
        }
    }
    for key in OPTIONAL {
        match obj.get(*key) {
            None | Some(Value::String(_)) => {}
            Some(other) => {
                return Err(fail(format!(
                    "{key}: Expected string, received {}",
                    type_name(other)
                )))
            }
        }
    }

    serde_json::from_value(payload.clone()).map_err(|e| fail(format!("(root): {e}")))
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
