use axum::http::StatusCode;
use std::time::Duration;

/// Failure inside one sandboxed script invocation.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to set up sandbox: {0}")]
    Setup(String),
    #[error("script failed to compile: {0}")]
    Compile(String),
    #[error("script raised an error: {0}")]
    Runtime(String),
    #[error("script execution timeout after {} ms", .0.as_millis())]
    Timeout(Duration),
    #[error("script exceeded a resource limit: {0}")]
    ResourceExceeded(String),
    #[error("script result could not be decoded: {0}")]
    Decode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unknown webhook {0}")]
    UnknownWebhook(String),
    #[error("record {0} not found")]
    NotFound(String),
}

/// Where a payload that failed validation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadOrigin {
    TransformOutput,
    RawBody,
    /// Raw body used because the transform returned nothing.
    FallbackRawBody,
}

impl std::fmt::Display for PayloadOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PayloadOrigin::TransformOutput => "transform output",
            PayloadOrigin::RawBody => "request body",
            PayloadOrigin::FallbackRawBody => "request body (transform fallback)",
        })
    }
}

/// First failing stage of a webhook request. Each variant maps to exactly
/// one HTTP status and one fixed public message; the `Display` text is the
/// diagnostic kept for logs and the audit trail.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("webhook id is required")]
    MissingWebhookId,
    #[error("webhook {0} not found or inactive")]
    WebhookNotFound(String),
    #[error("authorize returned false")]
    Unauthorized,
    #[error("authorization script failed: {0}")]
    AuthorizationScript(String),
    #[error("transform script failed: {0}")]
    TransformScript(#[source] SandboxError),
    #[error("{origin} failed validation: {detail}")]
    InvalidEvent { origin: PayloadOrigin, detail: String },
    #[error("unknown event type {0:?}")]
    UnknownEvent(String),
    #[error("no message {message_id} in organization {organization_id}")]
    MessageNotFound {
        message_id: String,
        organization_id: String,
    },
    #[error("request body rejected: {detail}")]
    BodyRejected { status: StatusCode, detail: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::MissingWebhookId
            | PipelineError::InvalidEvent { .. }
            | PipelineError::UnknownEvent(_) => StatusCode::BAD_REQUEST,
            PipelineError::Unauthorized => StatusCode::UNAUTHORIZED,
            PipelineError::WebhookNotFound(_) | PipelineError::MessageNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            PipelineError::BodyRejected { status, .. } => *status,
            PipelineError::AuthorizationScript(_)
            | PipelineError::TransformScript(_)
            | PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Text placed in the `{"error": ...}` response body. Never carries
    /// engine internals.
    pub fn public_message(&self) -> String {
        match self {
            PipelineError::MissingWebhookId => "Webhook ID is required".into(),
            PipelineError::WebhookNotFound(_) => "Webhook not found or inactive".into(),
            PipelineError::Unauthorized => "Unauthorized".into(),
            PipelineError::AuthorizationScript(_) => "Authorization code error".into(),
            PipelineError::TransformScript(_) => "Transform code error".into(),
            PipelineError::InvalidEvent { detail, .. } => {
                format!("Payload validation error: {detail}")
            }
            PipelineError::UnknownEvent(_) => "Unknown event type".into(),
            PipelineError::MessageNotFound { .. } => "Message not found".into(),
            PipelineError::BodyRejected { .. } => "Request body could not be read".into(),
            PipelineError::Internal(_) => "Internal server error".into(),
        }
    }

    pub fn diagnostic(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_failures_stay_out_of_public_text() {
        let err = PipelineError::TransformScript(SandboxError::Runtime(
            "ReferenceError: transform is not defined".into(),
        ));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.public_message(), "Transform code error");
        assert!(err.diagnostic().contains("ReferenceError"));
    }

    #[test]
    fn timeout_diagnostic_mentions_timeout() {
        let err = PipelineError::TransformScript(SandboxError::Timeout(Duration::from_millis(50)));
        assert!(err.diagnostic().contains("timeout after 50 ms"));
    }

    #[test]
    fn validation_origin_is_diagnostic_only() {
        let err = PipelineError::InvalidEvent {
            origin: PayloadOrigin::FallbackRawBody,
            detail: "messageId: Required".into(),
        };
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            err.public_message(),
            "Payload validation error: messageId: Required"
        );
        assert!(err.diagnostic().starts_with("request body (transform fallback)"));
    }
}
