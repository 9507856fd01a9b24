//! LLM backend adapters: the `AgentHandler` contract, the streamed-delta
//! translator with its multi-turn tool loop, and the bundled adapters
//! (demo, Ollama, OpenAI-compatible).

pub mod accumulate;
pub mod demo;
pub mod handler;
pub mod mcp;
pub mod model;
pub mod ollama;
pub mod openai;
pub mod prompt;
pub mod stream;

pub use {
    demo::DemoAdapter,
    handler::{AgentEventSink, AgentHandler, RunContext, RunOutput, streams},
    mcp::{McpClient, ToolOutcome, ToolRouter},
    model::{ChatMessage, MessageRole, StreamChunk, ToolCall, ToolCallFragment, ToolDefinition},
};

/// Hard cap on backend re-entries within one run; a model that keeps calling
/// tools past this is cut off.
pub const MAX_TOOL_ITERATIONS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The backend rejected the request or the stream broke mid-flight.
    #[error("backend error: {0}")]
    Backend(String),
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend sent unparseable data: {0}")]
    Decode(#[from] serde_json::Error),
}
