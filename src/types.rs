use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Tenant-owned webhook configuration. Edited elsewhere, read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    pub id: String,
    pub organization_id: String,
    #[serde(default)]
    pub name: String,
    pub is_active: bool,
    #[serde(default)]
    pub auth_code: Option<String>,
    #[serde(default)]
    pub transform_code: Option<String>,
}

impl WebhookConfig {
    /// Script text that is present and not blank.
    pub fn auth_script(&self) -> Option<&str> {
        non_blank(self.auth_code.as_deref())
    }

    pub fn transform_script(&self) -> Option<&str> {
        non_blank(self.transform_code.as_deref())
    }
}

fn non_blank(code: Option<&str>) -> Option<&str> {
    code.filter(|c| !c.trim().is_empty())
}

/// One inbound HTTP call, reduced to the plain data scripts may see.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub query: Map<String, Value>,
    pub params: Map<String, Value>,
}

/// Delivery event after the optional transform. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformedEvent {
    pub message_id: String,
    pub event: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Queued,
    Pending,
    Sent,
    AwaitingWebhook,
    Opened,
    Clicked,
    Failed,
    Retrying,
    Cancelled,
    Complained,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "QUEUED",
            MessageStatus::Pending => "PENDING",
            MessageStatus::Sent => "SENT",
            MessageStatus::AwaitingWebhook => "AWAITING_WEBHOOK",
            MessageStatus::Opened => "OPENED",
            MessageStatus::Clicked => "CLICKED",
            MessageStatus::Failed => "FAILED",
            MessageStatus::Retrying => "RETRYING",
            MessageStatus::Cancelled => "CANCELLED",
            MessageStatus::Complained => "COMPLAINED",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sent message as the persistence layer knows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    /// Correlation id handed to the mail provider at send time.
    pub message_id: String,
    pub organization_id: String,
    pub status: MessageStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit record, one per inbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookLogEntry {
    pub id: String,
    pub webhook_id: String,
    pub request_body: Value,
    #[serde(default)]
    pub transformed_payload: Option<Value>,
    pub response_code: u16,
    pub response_body: Value,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// A page of audit entries, newest first.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
    pub items: Vec<WebhookLogEntry>,
    pub next_cursor: Option<String>,
}
