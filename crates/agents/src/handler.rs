//! The adapter contract between the run engine and a backend.

use std::sync::Arc;

use {async_trait::async_trait, serde_json::Value, tokio_util::sync::CancellationToken};

use sluice_sessions::{ContentPart, HistoryEntry};

use crate::AgentError;

/// `agent` event stream names.
pub mod streams {
    pub const LIFECYCLE: &str = "lifecycle";
    pub const ASSISTANT: &str = "assistant";
    pub const REASONING: &str = "reasoning";
    pub const TOOL: &str = "tool";
}

/// Where an adapter publishes its events. The gateway provides the
/// broadcast-backed implementation; tests provide recording sinks.
#[async_trait]
pub trait AgentEventSink: Send + Sync {
    /// Emit one `agent` event on the given stream. The implementation stamps
    /// the per-run sequence number and timestamp.
    async fn agent(&self, stream: &str, data: Value);

    /// Emit a `chat.delta` carrying the full accumulated text. Implementations
    /// throttle to one delta per ~150 ms unless `force` is set; the forced
    /// flush at end of stream guarantees the client holds the complete text.
    async fn chat_delta(&self, text: &str, force: bool);

    /// Record the accumulated assistant text so aborts and `agent.wait`
    /// observe the latest state.
    fn set_accumulated(&self, text: &str);
}

/// Everything an adapter needs to execute one run.
pub struct RunContext {
    pub run_id: String,
    pub session_key: String,
    /// The user message that started this run.
    pub message: String,
    /// History snapshot, including the already-appended user message.
    pub history: Vec<HistoryEntry>,
    /// Active model override, when the session selected one.
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub cancel: CancellationToken,
    pub sink: Arc<dyn AgentEventSink>,
}

impl RunContext {
    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// How a run ended, from the adapter's perspective.
#[derive(Debug)]
pub enum RunOutput {
    Completed {
        content: Vec<ContentPart>,
        text: String,
    },
    /// Cancellation was observed; nothing further was emitted.
    Aborted,
}

/// A pluggable backend. Implementations stream deltas through
/// `ctx.sink`, observe `ctx.cancel` at every suspension point, and return
/// once the run reaches a terminal state.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn run(&self, ctx: &RunContext) -> Result<RunOutput, AgentError>;

    /// Models this adapter can serve, for `models.list` and `/models`.
    fn models(&self) -> Vec<String> {
        vec![]
    }
}
