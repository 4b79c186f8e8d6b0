//! Persistence collaborators of the webhook pipeline.
//!
//! The pipeline only ever sees the three traits. `MemoryStore` backs tests
//! and embedding; `JsonFileStore` keeps webhooks and messages as JSON
//! documents and appends audit entries as JSON lines, one file per webhook.

use crate::error::StoreError;
use crate::types::{LogPage, Message, MessageStatus, WebhookConfig, WebhookLogEntry};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

pub const DEFAULT_LOG_PAGE: usize = 50;
pub const MAX_LOG_PAGE: usize = 100;

#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn find_active_webhook(&self, id: &str) -> Result<Option<WebhookConfig>, StoreError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Lookup scoped to one organization; other tenants' messages are
    /// invisible even when the correlation id matches.
    async fn find_by_correlation_id(
        &self,
        message_id: &str,
        organization_id: &str,
    ) -> Result<Option<Message>, StoreError>;

    async fn update_status(
        &self,
        id: &str,
        status: MessageStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AuditLogStore: Send + Sync {
    async fn append(&self, entry: WebhookLogEntry) -> Result<(), StoreError>;

    /// Newest-first page. `cursor` is the id of the first entry to return.
    async fn list_logs(
        &self,
        webhook_id: &str,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<LogPage, StoreError>;
}

/// Cut a newest-first page out of `entries` (oldest first, as appended).
pub fn page_newest_first(
    entries: &[WebhookLogEntry],
    limit: Option<usize>,
    cursor: Option<&str>,
) -> LogPage {
    let limit = limit.unwrap_or(DEFAULT_LOG_PAGE).clamp(1, MAX_LOG_PAGE);
    let mut newest: Vec<&WebhookLogEntry> = entries.iter().rev().collect();
    newest.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let start = match cursor {
        Some(id) => match newest.iter().position(|e| e.id == id) {
            Some(pos) => pos,
            None => {
                return LogPage {
                    items: Vec::new(),
                    next_cursor: None,
                }
            }
        },
        None => 0,
    };

    let mut items: Vec<WebhookLogEntry> = newest
        .into_iter()
        .skip(start)
        .take(limit + 1)
        .cloned()
        .collect();
    let next_cursor = if items.len() > limit {
        items.pop().map(|e| e.id)
    } else {
        None
    };
    LogPage { items, next_cursor }
}

// ─── In-memory store ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    webhooks: RwLock<HashMap<String, WebhookConfig>>,
    messages: RwLock<HashMap<String, Message>>,
    logs: RwLock<Vec<WebhookLogEntry>>,
    lookups: AtomicU64,
    status_writes: AtomicU64,
    fail_appends: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_webhook(&self, webhook: WebhookConfig) {
        self.webhooks
            .write()
            .await
            .insert(webhook.id.clone(), webhook);
    }

    pub async fn insert_message(&self, message: Message) {
        self.messages
            .write()
            .await
            .insert(message.id.clone(), message);
    }

    pub async fn message(&self, id: &str) -> Option<Message> {
        self.messages.read().await.get(id).cloned()
    }

    pub async fn logs(&self, webhook_id: &str) -> Vec<WebhookLogEntry> {
        self.logs
            .read()
            .await
            .iter()
            .filter(|e| e.webhook_id == webhook_id)
            .cloned()
            .collect()
    }

    /// Number of `find_by_correlation_id` calls.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Number of `update_status` calls that reached a message.
    pub fn status_writes(&self) -> u64 {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent `append` fail, to exercise audit failure paths.
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl WebhookStore for MemoryStore {
    async fn find_active_webhook(&self, id: &str) -> Result<Option<WebhookConfig>, StoreError> {
        Ok(self
            .webhooks
            .read()
            .await
            .get(id)
            .filter(|w| w.is_active)
            .cloned())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn find_by_correlation_id(
        &self,
        message_id: &str,
        organization_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .messages
            .read()
            .await
            .values()
            .find(|m| m.message_id == message_id && m.organization_id == organization_id)
            .cloned())
    }

    async fn update_status(
        &self,
        id: &str,
        status: MessageStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut messages = self.messages.write().await;
        let msg = messages
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        msg.status = status;
        msg.error = error;
        msg.updated_at = Utc::now();
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl AuditLogStore for MemoryStore {
    async fn append(&self, entry: WebhookLogEntry) -> Result<(), StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("audit store unavailable")));
        }
        self.logs.write().await.push(entry);
        Ok(())
    }

    async fn list_logs(
        &self,
        webhook_id: &str,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<LogPage, StoreError> {
        let entries = self.logs(webhook_id).await;
        Ok(page_newest_first(&entries, limit, cursor))
    }
}

// ─── JSON file store ──────────────────────────────────────────────────────────

const WEBHOOKS_FILE: &str = "webhooks.json";
const MESSAGES_FILE: &str = "messages.json";
const LOGS_DIR: &str = "webhook_logs";

pub struct JsonFileStore {
    data_dir: PathBuf,
    webhooks: RwLock<HashMap<String, WebhookConfig>>,
    messages: RwLock<HashMap<String, Message>>,
}

impl JsonFileStore {
    /// Open the store rooted at `data_dir`, loading whatever is already there.
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(data_dir.join(LOGS_DIR)).await?;

        let webhooks: Vec<WebhookConfig> = read_json_or_default(&data_dir.join(WEBHOOKS_FILE)).await?;
        let messages: Vec<Message> = read_json_or_default(&data_dir.join(MESSAGES_FILE)).await?;
        tracing::info!(
            data_dir = %data_dir.display(),
            webhooks = webhooks.len(),
            messages = messages.len(),
            "loaded store"
        );

        Ok(Self {
            webhooks: RwLock::new(webhooks.into_iter().map(|w| (w.id.clone(), w)).collect()),
            messages: RwLock::new(messages.into_iter().map(|m| (m.id.clone(), m)).collect()),
            data_dir,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The in-memory map only changes once the file write has succeeded.
    pub async fn upsert_webhook(&self, webhook: WebhookConfig) -> Result<(), StoreError> {
        let mut webhooks = self.webhooks.write().await;
        let mut items: Vec<&WebhookConfig> = webhooks
            .values()
            .filter(|w| w.id != webhook.id)
            .chain(std::iter::once(&webhook))
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        write_json(&self.data_dir.join(WEBHOOKS_FILE), &items).await?;
        webhooks.insert(webhook.id.clone(), webhook);
        Ok(())
    }

    pub async fn upsert_message(&self, message: Message) -> Result<(), StoreError> {
        let mut messages = self.messages.write().await;
        save_messages(&self.data_dir, &messages, &message).await?;
        messages.insert(message.id.clone(), message);
        Ok(())
    }

    pub async fn message(&self, id: &str) -> Option<Message> {
        self.messages.read().await.get(id).cloned()
    }

    fn log_path(&self, webhook_id: &str) -> PathBuf {
        self.data_dir
            .join(LOGS_DIR)
            .join(format!("{webhook_id}.jsonl"))
    }

    async fn is_known_webhook(&self, id: &str) -> bool {
        self.webhooks.read().await.contains_key(id)
    }

    async fn read_logs(&self, webhook_id: &str) -> Result<Vec<WebhookLogEntry>, StoreError> {
        let path = self.log_path(webhook_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<WebhookLogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping corrupt log line"),
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl WebhookStore for JsonFileStore {
    async fn find_active_webhook(&self, id: &str) -> Result<Option<WebhookConfig>, StoreError> {
        Ok(self
            .webhooks
            .read()
            .await
            .get(id)
            .filter(|w| w.is_active)
            .cloned())
    }
}

#[async_trait]
impl MessageStore for JsonFileStore {
    async fn find_by_correlation_id(
        &self,
        message_id: &str,
        organization_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        Ok(self
            .messages
            .read()
            .await
            .values()
            .find(|m| m.message_id == message_id && m.organization_id == organization_id)
            .cloned())
    }

    async fn update_status(
        &self,
        id: &str,
        status: MessageStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut messages = self.messages.write().await;
        let mut updated = messages
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        updated.status = status;
        updated.error = error;
        updated.updated_at = Utc::now();

        save_messages(&self.data_dir, &messages, &updated).await?;
        messages.insert(updated.id.clone(), updated);
        Ok(())
    }
}

#[async_trait]
impl AuditLogStore for JsonFileStore {
    async fn append(&self, entry: WebhookLogEntry) -> Result<(), StoreError> {
        // Log files are keyed by webhook id, so only ids the store knows may
        // name a file.
        if !self.is_known_webhook(&entry.webhook_id).await {
            return Err(StoreError::UnknownWebhook(entry.webhook_id));
        }
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(&entry.webhook_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn list_logs(
        &self,
        webhook_id: &str,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<LogPage, StoreError> {
        if !self.is_known_webhook(webhook_id).await {
            return Err(StoreError::UnknownWebhook(webhook_id.to_string()));
        }
        let entries = self.read_logs(webhook_id).await?;
        Ok(page_newest_first(&entries, limit, cursor))
    }
}

async fn read_json_or_default<T>(path: &Path) -> Result<Vec<T>, StoreError>
where
    T: serde::de::DeserializeOwned,
{
    match tokio::fs::read_to_string(path).await {
        Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Persist `messages` with `pending` written over any entry of the same id.
async fn save_messages(
    data_dir: &Path,
    messages: &HashMap<String, Message>,
    pending: &Message,
) -> Result<(), StoreError> {
    let mut items: Vec<&Message> = messages
        .values()
        .filter(|m| m.id != pending.id)
        .chain(std::iter::once(pending))
        .collect();
    items.sort_by(|a, b| a.id.cmp(&b.id));
    write_json(&data_dir.join(MESSAGES_FILE), &items).await
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn webhook(id: &str, org: &str) -> WebhookConfig {
        WebhookConfig {
            id: id.into(),
            organization_id: org.into(),
            name: "provider".into(),
            is_active: true,
            auth_code: None,
            transform_code: None,
        }
    }

    fn message(id: &str, correlation: &str, org: &str) -> Message {
        Message {
            id: id.into(),
            message_id: correlation.into(),
            organization_id: org.into(),
            status: MessageStatus::Queued,
            error: None,
            updated_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn entry(id: &str, webhook_id: &str, minute: i64) -> WebhookLogEntry {
        WebhookLogEntry {
            id: id.into(),
            webhook_id: webhook_id.into(),
            request_body: json!({}),
            transformed_payload: None,
            response_code: 200,
            response_body: json!({ "success": true }),
            error: None,
            duration_ms: 1,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minute),
        }
    }

    #[test]
    fn paging_is_newest_first_with_inclusive_cursor() {
        let entries: Vec<_> = (0..5).map(|i| entry(&format!("e{i}"), "wh", i)).collect();

        let first = page_newest_first(&entries, Some(2), None);
        let ids: Vec<_> = first.items.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["e4", "e3"]);
        assert_eq!(first.next_cursor.as_deref(), Some("e2"));

        let second = page_newest_first(&entries, Some(2), first.next_cursor.as_deref());
        let ids: Vec<_> = second.items.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["e2", "e1"]);

        let last = page_newest_first(&entries, Some(2), Some("e0"));
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.next_cursor, None);
    }

    #[test]
    fn paging_clamps_limit() {
        let entries: Vec<_> = (0..3).map(|i| entry(&format!("e{i}"), "wh", i)).collect();
        assert_eq!(page_newest_first(&entries, Some(0), None).items.len(), 1);
        assert_eq!(page_newest_first(&entries, Some(500), None).items.len(), 3);
        assert!(page_newest_first(&entries, None, Some("missing")).items.is_empty());
    }

    #[tokio::test]
    async fn memory_lookup_is_tenant_scoped() {
        let store = MemoryStore::new();
        store.insert_message(message("1", "msg-1", "org-b")).await;

        let hit = store.find_by_correlation_id("msg-1", "org-b").await.unwrap();
        assert!(hit.is_some());
        let miss = store.find_by_correlation_id("msg-1", "org-a").await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn memory_hides_inactive_webhooks() {
        let store = MemoryStore::new();
        let mut hook = webhook("wh-off", "org");
        hook.is_active = false;
        store.insert_webhook(hook).await;
        assert!(store.find_active_webhook("wh-off").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonFileStore::open(dir.path()).await.unwrap();
            store.upsert_webhook(webhook("wh-1", "org-a")).await.unwrap();
            store.upsert_message(message("1", "msg-1", "org-a")).await.unwrap();
            store
                .update_status("1", MessageStatus::Opened, None)
                .await
                .unwrap();
            store.append(entry("e0", "wh-1", 0)).await.unwrap();
            store.append(entry("e1", "wh-1", 1)).await.unwrap();
        }

        let reopened = JsonFileStore::open(dir.path()).await.unwrap();
        assert!(reopened.find_active_webhook("wh-1").await.unwrap().is_some());
        let msg = reopened.message("1").await.unwrap();
        assert_eq!(msg.status, MessageStatus::Opened);

        let page = reopened.list_logs("wh-1", None, None).await.unwrap();
        let ids: Vec<_> = page.items.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["e1", "e0"]);
    }

    #[tokio::test]
    async fn failed_status_write_leaves_memory_and_disk_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        store.upsert_message(message("1", "msg-1", "org-a")).await.unwrap();

        // A directory where the temp file should go makes the write fail.
        tokio::fs::create_dir(dir.path().join("messages.json.tmp"))
            .await
            .unwrap();

        let result = store.update_status("1", MessageStatus::Failed, None).await;
        assert!(result.is_err());
        assert_eq!(
            store.message("1").await.unwrap().status,
            MessageStatus::Queued
        );
        tokio::fs::remove_dir(dir.path().join("messages.json.tmp"))
            .await
            .unwrap();
        let reopened = JsonFileStore::open(dir.path()).await.unwrap();
        assert_eq!(
            reopened.message("1").await.unwrap().status,
            MessageStatus::Queued
        );
    }

    #[tokio::test]
    async fn file_store_refuses_logs_for_unknown_webhooks() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        let err = store.append(entry("e0", "../escape", 0)).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownWebhook(_)));
        assert!(!dir.path().join("escape.jsonl").exists());
    }
}
