use crate::error::PipelineError;
use crate::events::{resolve_reason, StatusMapping};
use crate::store::MessageStore;
use crate::types::{MessageStatus, TransformedEvent};
use std::sync::Arc;

/// Result of a status write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedStatus {
    pub id: String,
    pub previous: MessageStatus,
    pub status: MessageStatus,
    pub error: Option<String>,
}

/// Applies mapped events to messages of one organization. Last write wins:
/// there is no ordering or duplicate check between deliveries.
#[derive(Clone)]
pub struct StatusUpdater {
    messages: Arc<dyn MessageStore>,
}

impl StatusUpdater {
    pub fn new(messages: Arc<dyn MessageStore>) -> Self {
        Self { messages }
    }

    pub async fn apply(
        &self,
        organization_id: &str,
        event: &TransformedEvent,
        mapping: StatusMapping,
    ) -> Result<AppliedStatus, PipelineError> {
        let message = self
            .messages
            .find_by_correlation_id(&event.message_id, organization_id)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "message lookup failed");
                PipelineError::Internal(format!("message lookup failed: {e}"))
            })?
            .ok_or_else(|| {
                tracing::warn!(message_id = %event.message_id, "message not found");
                PipelineError::MessageNotFound {
                    message_id: event.message_id.clone(),
                    organization_id: organization_id.to_string(),
                }
            })?;

        let error = resolve_reason(event, &mapping);
        self.messages
            .update_status(&message.id, mapping.status, error.clone())
            .await
            .map_err(|e| {
                tracing::error!(message = %message.id, error = %e, "status update failed");
                PipelineError::Internal(format!("status update failed: {e}"))
            })?;

        tracing::info!(
            message = %message.id,
            from = %message.status,
            to = %mapping.status,
            "updated message status"
        );

        Ok(AppliedStatus {
            id: message.id,
            previous: message.status,
            status: mapping.status,
            error,
        })
    }
}
