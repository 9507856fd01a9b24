//! In-memory session store: history map plus metadata map behind one lock.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::sync::RwLock;

use crate::{
    DEFAULT_HISTORY_LIMIT, DiskLog, HistoryEntry, MAX_HISTORY_LIMIT, MAX_LABEL_LEN, SessionMeta,
    SessionSummary,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("label exceeds {MAX_LABEL_LEN} characters")]
    LabelTooLong,
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct StoreInner {
    history: HashMap<String, Vec<HistoryEntry>>,
    metadata: HashMap<String, SessionMeta>,
}

/// Per-session ordered message log with metadata.
///
/// A session exists for listing iff it has either a metadata record or at
/// least one history entry. History is append-only within a session's
/// lifetime; `delete` purges both maps atomically.
pub struct SessionStore {
    inner: RwLock<StoreInner>,
    disk_log: Option<Arc<DiskLog>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                history: HashMap::new(),
                metadata: HashMap::new(),
            }),
            disk_log: None,
        }
    }

    /// Forward every appended entry to a JSONL disk log.
    pub fn with_disk_log(mut self, log: Arc<DiskLog>) -> Self {
        self.disk_log = Some(log);
        self
    }

    /// Append an entry, creating the session on first use.
    pub async fn append(&self, key: &str, entry: HistoryEntry) {
        let now = unix_now_ms();
        {
            let mut inner = self.inner.write().await;
            inner
                .metadata
                .entry(key.to_string())
                .and_modify(|m| m.last_active_at = now.max(entry.timestamp))
                .or_insert_with(|| SessionMeta {
                    created_at: now,
                    last_active_at: now.max(entry.timestamp),
                    label: None,
                });
            inner
                .history
                .entry(key.to_string())
                .or_default()
                .push(entry.clone());
        }
        if let Some(log) = &self.disk_log {
            log.append(key, &entry).await;
        }
    }

    /// Last `limit` entries in insertion order. `limit` is clamped to
    /// [`MAX_HISTORY_LIMIT`]; `None` means [`DEFAULT_HISTORY_LIMIT`].
    pub async fn history(&self, key: &str, limit: Option<usize>) -> Vec<HistoryEntry> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT);
        let inner = self.inner.read().await;
        let Some(entries) = inner.history.get(key) else {
            return vec![];
        };
        let start = entries.len().saturating_sub(limit);
        entries[start..].to_vec()
    }

    /// Full history snapshot (for prompt building).
    pub async fn full_history(&self, key: &str) -> Vec<HistoryEntry> {
        let inner = self.inner.read().await;
        inner.history.get(key).cloned().unwrap_or_default()
    }

    pub async fn message_count(&self, key: &str) -> usize {
        let inner = self.inner.read().await;
        inner.history.get(key).map(Vec::len).unwrap_or(0)
    }

    pub async fn exists(&self, key: &str) -> bool {
        let inner = self.inner.read().await;
        inner.history.contains_key(key) || inner.metadata.contains_key(key)
    }

    /// Drop history and metadata together. Idempotent.
    pub async fn delete(&self, key: &str) {
        let mut inner = self.inner.write().await;
        inner.history.remove(key);
        inner.metadata.remove(key);
    }

    /// Drop history only; metadata (and its label) survives.
    pub async fn reset(&self, key: &str) {
        let mut inner = self.inner.write().await;
        inner.history.remove(key);
        if let Some(meta) = inner.metadata.get_mut(key) {
            meta.last_active_at = unix_now_ms();
        }
    }

    /// Update metadata, creating it if missing.
    pub async fn patch(&self, key: &str, label: Option<String>) -> Result<SessionMeta, StoreError> {
        if let Some(ref l) = label
            && l.chars().count() > MAX_LABEL_LEN
        {
            return Err(StoreError::LabelTooLong);
        }
        let now = unix_now_ms();
        let mut inner = self.inner.write().await;
        let meta = inner
            .metadata
            .entry(key.to_string())
            .or_insert_with(|| SessionMeta {
                created_at: now,
                last_active_at: now,
                label: None,
            });
        if label.is_some() {
            meta.label = label;
        }
        Ok(meta.clone())
    }

    /// Merged view over sessions that have metadata and sessions that only
    /// have history, ordered by creation time.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let inner = self.inner.read().await;
        let mut out: Vec<SessionSummary> = Vec::with_capacity(inner.metadata.len());
        for (key, meta) in &inner.metadata {
            out.push(SessionSummary {
                key: key.clone(),
                label: meta.label.clone(),
                created_at: meta.created_at,
                last_active_at: meta.last_active_at,
                message_count: inner.history.get(key).map(Vec::len).unwrap_or(0),
            });
        }
        // History-only sessions can exist if an append raced a delete; list
        // them with timestamps derived from their entries.
        for (key, entries) in &inner.history {
            if inner.metadata.contains_key(key) {
                continue;
            }
            let created = entries.first().map(|e| e.timestamp).unwrap_or(0);
            let last = entries.last().map(|e| e.timestamp).unwrap_or(created);
            out.push(SessionSummary {
                key: key.clone(),
                label: None,
                created_at: created,
                last_active_at: last,
                message_count: entries.len(),
            });
        }
        out.sort_by_key(|s| s.created_at);
        out
    }
}
