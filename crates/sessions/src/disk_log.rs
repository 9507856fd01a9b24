//! Advisory JSONL log: one file per (session, UTC date).
//!
//! Write failures are logged and swallowed; the in-memory store is the
//! source of truth.

use std::path::PathBuf;

use {serde::Serialize, tokio::io::AsyncWriteExt, tracing::warn};

use crate::HistoryEntry;

/// Longest filename component derived from a session key.
const MAX_KEY_COMPONENT: usize = 64;

#[derive(Serialize)]
struct LogLine<'a> {
    session: &'a str,
    role: &'a crate::Role,
    content: &'a [crate::ContentPart],
    timestamp: u64,
    #[serde(rename = "stopReason", skip_serializing_if = "Option::is_none")]
    stop_reason: &'a Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: &'a Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: &'a Option<String>,
}

pub struct DiskLog {
    dir: PathBuf,
}

impl DiskLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Append one entry to the session's file for today (UTC).
    pub async fn append(&self, session_key: &str, entry: &HistoryEntry) {
        let line = LogLine {
            session: session_key,
            role: &entry.role,
            content: &entry.content,
            timestamp: entry.timestamp,
            stop_reason: &entry.stop_reason,
            model: &entry.model,
            provider: &entry.provider,
        };
        let json = match serde_json::to_string(&line) {
            Ok(j) => j,
            Err(e) => {
                warn!("disk log serialize failed: {e}");
                return;
            },
        };
        let path = self.path_for(session_key);
        if let Err(e) = self.write_line(&path, &json).await {
            warn!(path = %path.display(), "disk log write failed: {e}");
        }
    }

    fn path_for(&self, session_key: &str) -> PathBuf {
        let date = chrono::Utc::now().format("%Y-%m-%d");
        self.dir
            .join(format!("{}-{date}.jsonl", sanitize_key(session_key)))
    }

    async fn write_line(&self, path: &PathBuf, json: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }
}

/// Session keys are free-form strings; the filename component replaces
/// anything outside `[A-Za-z0-9_-]` and truncates to 64 chars. The original
/// key is preserved in the `session` field of every line.
fn sanitize_key(key: &str) -> String {
    let mut out: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    out.truncate(MAX_KEY_COMPONENT);
    out
}
