//! Provider event vocabulary -> internal message status.

use crate::types::{MessageStatus, TransformedEvent};
use serde::Serialize;

/// One canonical event, the aliases providers use for it, and its effect.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDefinition {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub status: MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_reason: Option<&'static str>,
    pub description: &'static str,
}

pub const EVENT_CATALOG: &[EventDefinition] = &[
    EventDefinition {
        name: "pending",
        aliases: &["delayed"],
        status: MessageStatus::Pending,
        default_reason: None,
        description: "Email is pending or delayed in the queue",
    },
    EventDefinition {
        name: "delivered",
        aliases: &["sent"],
        status: MessageStatus::Sent,
        default_reason: None,
        description: "Email was successfully delivered",
    },
    EventDefinition {
        name: "opened",
        aliases: &["open"],
        status: MessageStatus::Opened,
        default_reason: None,
        description: "Email was opened by recipient",
    },
    EventDefinition {
        name: "clicked",
        aliases: &["click"],
        status: MessageStatus::Clicked,
        default_reason: None,
        description: "Link in email was clicked",
    },
    EventDefinition {
        name: "bounced",
        aliases: &["bounce", "failed"],
        status: MessageStatus::Failed,
        default_reason: Some("Email bounced"),
        description: "Email bounced or failed to deliver",
    },
    EventDefinition {
        name: "complained",
        aliases: &["complaint", "spam"],
        status: MessageStatus::Complained,
        default_reason: Some("Spam complaint"),
        description: "Recipient marked email as spam",
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusMapping {
    pub status: MessageStatus,
    pub default_reason: Option<&'static str>,
}

/// Case-insensitive lookup over canonical names and aliases. Anything else
/// is `None`; there is no fallback status.
pub fn map_event(event: &str) -> Option<StatusMapping> {
    let key = event.to_lowercase();
    EVENT_CATALOG
        .iter()
        .find(|def| def.name == key || def.aliases.contains(&key.as_str()))
        .map(|def| StatusMapping {
            status: def.status,
            default_reason: def.default_reason,
        })
}

/// Error text to store: the event's own `reason`, then its `error`, then the
/// table default. Empty strings count as absent.
pub fn resolve_reason(event: &TransformedEvent, mapping: &StatusMapping) -> Option<String> {
    [event.reason.as_deref(), event.error.as_deref()]
        .into_iter()
        .flatten()
        .find(|r| !r.is_empty())
        .map(str::to_string)
        .or_else(|| mapping.default_reason.map(str::to_string))
}
