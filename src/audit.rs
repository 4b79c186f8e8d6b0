use crate::store::AuditLogStore;
use crate::types::WebhookLogEntry;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Everything known about a request once its response is fixed.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub webhook_id: String,
    pub request_body: Value,
    pub transformed_payload: Option<Value>,
    pub response_code: u16,
    pub response_body: Value,
    pub error: Option<String>,
    pub elapsed: Duration,
}

/// Best-effort audit trail. Append failures are logged and swallowed.
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuditLogStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn AuditLogStore>) -> Self {
        Self { store }
    }

    /// Returns whether the entry was stored; callers must not act on it
    /// beyond diagnostics.
    pub async fn record(&self, record: AuditRecord) -> bool {
        let entry = WebhookLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            webhook_id: record.webhook_id,
            request_body: record.request_body,
            transformed_payload: record.transformed_payload,
            response_code: record.response_code,
            response_body: record.response_body,
            error: record.error,
            duration_ms: record.elapsed.as_millis() as u64,
            created_at: Utc::now(),
        };
        let webhook_id = entry.webhook_id.clone();
        match self.store.append(entry).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(webhook_id = %webhook_id, error = %e, "failed to write webhook log");
                false
            }
        }
    }
}
