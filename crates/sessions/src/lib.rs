//! Per-session conversation history: ordered message log plus metadata.
//!
//! Sessions are process-local; the JSONL disk log is an advisory append-only
//! record, never read back.

pub mod disk_log;
pub mod store;

use serde::{Deserialize, Serialize};

pub use {
    disk_log::DiskLog,
    store::{SessionStore, StoreError},
};

/// Longest accepted session label.
pub const MAX_LABEL_LEN: usize = 64;
/// Hard cap on `history(key, limit)`.
pub const MAX_HISTORY_LIMIT: usize = 1_000;
/// Default `history` page size.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One block of an assistant or user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolCall {
        name: String,
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        arguments: serde_json::Value,
        status: ToolCallStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(rename = "resultError", skip_serializing_if = "Option::is_none")]
        result_error: Option<String>,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn thinking(thinking: impl Into<String>) -> Self {
        Self::Thinking {
            thinking: thinking.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Success,
    Error,
}

/// One stored message in a session's ordered history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: Vec<ContentPart>,
    /// Unix millis.
    pub timestamp: u64,
    #[serde(rename = "stopReason", skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl HistoryEntry {
    pub fn user(text: impl Into<String>, timestamp: u64) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentPart::text(text)],
            timestamp,
            stop_reason: None,
            model: None,
            provider: None,
        }
    }

    pub fn assistant(content: Vec<ContentPart>, timestamp: u64) -> Self {
        Self {
            role: Role::Assistant,
            content,
            timestamp,
            stop_reason: None,
            model: None,
            provider: None,
        }
    }

    /// Concatenated text blocks, ignoring thinking and tool calls.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.content {
            if let ContentPart::Text { text } = part {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }
}

/// Session metadata, kept separately from history so a label survives a
/// `reset`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    #[serde(rename = "lastActiveAt")]
    pub last_active_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Row returned by `SessionStore::list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    #[serde(rename = "lastActiveAt")]
    pub last_active_at: u64,
    #[serde(rename = "messageCount")]
    pub message_count: usize,
}
