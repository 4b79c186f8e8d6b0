use crate::error::{PayloadOrigin, PipelineError};
use crate::sandbox::{Binding, Invocation, Sandbox};
use crate::types::{InboundRequest, TransformedEvent, WebhookConfig};
use crate::validate::validate_event;
use serde_json::Value;

/// Calls `transform(payload, headers, query)` and drops `undefined`-valued
/// keys so the result survives the shim encoder.
const TRANSFORM_ENTRY: &str = r#"(function () {
  const result = transform(payload, headers, query);
  const cleanResult = {};
  for (const key in result) {
    if (result[key] !== undefined) {
      cleanResult[key] = result[key];
    }
  }
  return cleanResult;
})()"#;

/// Outcome of the transform stage: the validated event, plus the raw script
/// output when a transform ran and produced something.
#[derive(Debug, Clone)]
pub struct TransformOutcome {
    pub event: TransformedEvent,
    pub transformed: Option<Value>,
}

/// Error from the transform stage, with whatever the script produced before
/// validation rejected it.
#[derive(Debug)]
pub struct TransformFailure {
    pub error: PipelineError,
    pub transformed: Option<Value>,
}

impl From<PipelineError> for TransformFailure {
    fn from(error: PipelineError) -> Self {
        Self {
            error,
            transformed: None,
        }
    }
}

pub async fn transform(
    sandbox: &Sandbox,
    webhook: &WebhookConfig,
    request: &InboundRequest,
) -> Result<TransformOutcome, TransformFailure> {
    let Some(code) = webhook.transform_script() else {
        let event = validate_event(&request.body, PayloadOrigin::RawBody)?;
        return Ok(TransformOutcome {
            event,
            transformed: None,
        });
    };

    let invocation = Invocation {
        label: "transform",
        code: code.to_string(),
        bindings: vec![
            Binding::json("payload", request.body.clone()),
            Binding::strings("headers", request.headers.clone()),
            Binding::json("query", Value::Object(request.query.clone())),
        ],
        entry: TRANSFORM_ENTRY.to_string(),
    };

    let output = sandbox.run(invocation).await.map_err(|e| {
        tracing::warn!(webhook_id = %webhook.id, error = %e, "transform script failed");
        PipelineError::TransformScript(e)
    })?;

    match output {
        Some(value) if !is_empty(&value) => match validate_event(&value, PayloadOrigin::TransformOutput) {
            Ok(event) => Ok(TransformOutcome {
                event,
                transformed: Some(value),
            }),
            Err(error) => Err(TransformFailure {
                error,
                transformed: Some(value),
            }),
        },
        other => {
            tracing::warn!(webhook_id = %webhook.id, "transform returned nothing, validating raw body");
            match validate_event(&request.body, PayloadOrigin::FallbackRawBody) {
                Ok(event) => Ok(TransformOutcome {
                    event,
                    transformed: other,
                }),
                Err(error) => Err(TransformFailure {
                    error,
                    transformed: other,
                }),
            }
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
