//! OpenAI-compatible backend adapter: SSE streaming against
//! `POST /v1/chat/completions`.
//!
//! Also speaks to LM Studio, vLLM, and other servers exposing the same
//! surface.

use {async_trait::async_trait, futures_util::StreamExt, serde::Deserialize, serde_json::json};

use crate::{
    AgentError,
    handler::{AgentHandler, RunContext, RunOutput},
    mcp::ToolRouter,
    model::{ChatMessage, MessageRole, StreamChunk, ToolCallFragment, ToolDefinition},
    stream::{ChunkStream, StreamingBackend, run_stream_loop},
};

pub struct OpenAiCompatAdapter {
    base_url: String,
    model: String,
    api_key: Option<String>,
    tools: ToolRouter,
    http: reqwest::Client,
}

impl OpenAiCompatAdapter {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: {
                let url: String = base_url.into();
                url.trim_end_matches('/').to_string()
            },
            model: model.into(),
            api_key: None,
            tools: ToolRouter::default(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_tools(mut self, tools: ToolRouter) -> Self {
        self.tools = tools;
        self
    }
}

#[async_trait]
impl AgentHandler for OpenAiCompatAdapter {
    async fn run(&self, ctx: &RunContext) -> Result<RunOutput, AgentError> {
        let model = ctx.model.clone().unwrap_or_else(|| self.model.clone());
        run_stream_loop(self, &model, &self.tools, ctx).await
    }

    fn models(&self) -> Vec<String> {
        vec![self.model.clone()]
    }
}

#[async_trait]
impl StreamingBackend for OpenAiCompatAdapter {
    async fn open_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<Box<dyn ChunkStream>, AgentError> {
        let mut body = json!({
            "model": model,
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools.iter().map(wire_tool).collect::<Vec<_>>());
        }

        let mut req = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(AgentError::Backend(format!("upstream: {status} {text}")));
        }
        Ok(Box::new(SseStream {
            bytes: Box::pin(res.bytes_stream()),
            buffer: Vec::new(),
            pending: std::collections::VecDeque::new(),
            done: false,
        }))
    }
}

fn wire_message(msg: &ChatMessage) -> serde_json::Value {
    let role = match msg.role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    };
    let mut out = json!({"role": role, "content": msg.content});
    if let Some(calls) = &msg.tool_calls {
        out["tool_calls"] = json!(
            calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {
                            "name": c.name,
                            "arguments": c.arguments.to_string(),
                        }
                    })
                })
                .collect::<Vec<_>>()
        );
    }
    if let Some(id) = &msg.tool_call_id {
        out["tool_call_id"] = json!(id);
    }
    out
}

fn wire_tool(tool: &ToolDefinition) -> serde_json::Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ── SSE parsing ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SseChunk {
    #[serde(default)]
    choices: Vec<SseChoice>,
}

#[derive(Deserialize)]
struct SseChoice {
    #[serde(default)]
    delta: Option<SseDelta>,
}

#[derive(Deserialize)]
struct SseDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<SseToolDelta>>,
}

#[derive(Deserialize)]
struct SseToolDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<SseFunctionDelta>,
}

#[derive(Deserialize)]
struct SseFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Parse one SSE line. Returns accumulated chunks plus whether the `[DONE]`
/// sentinel was seen.
fn parse_sse_line(line: &str) -> (Vec<StreamChunk>, bool) {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return (vec![], false);
    };
    if data == "[DONE]" {
        return (vec![], true);
    }
    let Ok(parsed) = serde_json::from_str::<SseChunk>(data) else {
        return (vec![], false);
    };
    let mut chunks = Vec::new();
    for choice in parsed.choices {
        let Some(delta) = choice.delta else { continue };
        if let Some(reasoning) = delta.reasoning_content
            && !reasoning.is_empty()
        {
            chunks.push(StreamChunk::thinking(reasoning));
        }
        if let Some(content) = delta.content
            && !content.is_empty()
        {
            chunks.push(StreamChunk::text(content));
        }
        for call in delta.tool_calls.unwrap_or_default() {
            let function = call.function.unwrap_or(SseFunctionDelta {
                name: None,
                arguments: None,
            });
            chunks.push(StreamChunk {
                tool_call: Some(ToolCallFragment {
                    index: call.index,
                    id: call.id,
                    name: function.name,
                    arguments: function.arguments,
                }),
                ..Default::default()
            });
        }
    }
    (chunks, false)
}

struct SseStream {
    bytes: futures_util::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    buffer: Vec<u8>,
    pending: std::collections::VecDeque<StreamChunk>,
    done: bool,
}

impl SseStream {
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (chunks, done) = parse_sse_line(line);
            self.pending.extend(chunks);
            if done {
                self.done = true;
            }
        }
    }
}

#[async_trait]
impl ChunkStream for SseStream {
    async fn next_chunk(&mut self) -> Result<Option<StreamChunk>, AgentError> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Ok(Some(chunk));
            }
            if self.done {
                return Ok(None);
            }
            match self.bytes.next().await {
                Some(Ok(bytes)) => {
                    self.buffer.extend_from_slice(&bytes);
                    self.drain_lines();
                },
                Some(Err(e)) => return Err(AgentError::Http(e)),
                None => return Ok(None),
            }
        }
    }
}
