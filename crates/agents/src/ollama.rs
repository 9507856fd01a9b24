//! Ollama backend adapter: NDJSON streaming against `POST /api/chat`.

use {async_trait::async_trait, futures_util::StreamExt, serde::Deserialize, serde_json::json};

use crate::{
    AgentError,
    handler::{AgentHandler, RunContext, RunOutput},
    mcp::ToolRouter,
    model::{ChatMessage, MessageRole, StreamChunk, ToolCallFragment, ToolDefinition},
    stream::{ChunkStream, StreamingBackend, run_stream_loop},
};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";
pub const DEFAULT_MODEL: &str = "llama3.2:latest";

pub struct OllamaAdapter {
    base_url: String,
    model: String,
    tools: ToolRouter,
    http: reqwest::Client,
}

impl OllamaAdapter {
    pub fn new(base_url: Option<String>, model: Option<String>) -> Self {
        Self {
            base_url: base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.into()),
            tools: ToolRouter::default(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_tools(mut self, tools: ToolRouter) -> Self {
        self.tools = tools;
        self
    }
}

#[async_trait]
impl AgentHandler for OllamaAdapter {
    async fn run(&self, ctx: &RunContext) -> Result<RunOutput, AgentError> {
        let model = ctx.model.clone().unwrap_or_else(|| self.model.clone());
        run_stream_loop(self, &model, &self.tools, ctx).await
    }

    fn models(&self) -> Vec<String> {
        vec![self.model.clone()]
    }
}

#[async_trait]
impl StreamingBackend for OllamaAdapter {
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

        let res = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(AgentError::Backend(format!("ollama: {status} {text}")));
        }
        Ok(Box::new(NdjsonStream {
            bytes: Box::pin(res.bytes_stream()),
            buffer: Vec::new(),
            pending: std::collections::VecDeque::new(),
            synthetic_index: 0,
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
                .map(|c| json!({"function": {"name": c.name, "arguments": c.arguments}}))
                .collect::<Vec<_>>()
        );
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

// ── Stream parsing ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct NdjsonEvent {
    #[serde(default)]
    message: Option<NdjsonMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct NdjsonMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<NdjsonToolCall>>,
}

#[derive(Deserialize)]
struct NdjsonToolCall {
    function: NdjsonFunction,
}

#[derive(Deserialize)]
struct NdjsonFunction {
    #[serde(default)]
    index: Option<usize>,
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

/// Parse one NDJSON line into stream chunks. Ollama delivers tool calls
/// whole, so each becomes a single self-contained fragment.
fn parse_line(line: &str, next_index: &mut usize) -> (Vec<StreamChunk>, bool) {
    let Ok(event) = serde_json::from_str::<NdjsonEvent>(line) else {
        return (vec![], false);
    };
    let mut chunks = Vec::new();
    if let Some(msg) = event.message {
        if let Some(thinking) = msg.thinking
            && !thinking.is_empty()
        {
            chunks.push(StreamChunk::thinking(thinking));
        }
        if !msg.content.is_empty() {
            chunks.push(StreamChunk::text(msg.content));
        }
        for call in msg.tool_calls.unwrap_or_default() {
            let index = call.function.index.unwrap_or_else(|| {
                let i = *next_index;
                *next_index += 1;
                i
            });
            chunks.push(StreamChunk {
                tool_call: Some(ToolCallFragment {
                    index,
                    id: None,
                    name: Some(call.function.name),
                    arguments: Some(call.function.arguments.to_string()),
                }),
                ..Default::default()
            });
        }
    }
    (chunks, event.done)
}

struct NdjsonStream {
    bytes: futures_util::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    buffer: Vec<u8>,
    pending: std::collections::VecDeque<StreamChunk>,
    /// Next index handed to tool calls the backend sent without one.
    synthetic_index: usize,
    done: bool,
}

impl NdjsonStream {
    fn drain_lines(&mut self) {
        let mut next_index = self.synthetic_index;
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (chunks, done) = parse_line(line, &mut next_index);
            self.pending.extend(chunks);
            if done {
                self.done = true;
            }
        }
        self.synthetic_index = next_index;
    }
}

#[async_trait]
impl ChunkStream for NdjsonStream {
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

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_delta() {
        let mut idx = 0;
        let (chunks, done) =
            parse_line(r#"{"message":{"role":"assistant","content":"hel"},"done":false}"#, &mut idx);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text.as_deref(), Some("hel"));
        assert!(!done);
    }

    #[test]
    fn parses_thinking_delta() {
        let mut idx = 0;
        let (chunks, _) = parse_line(
            r#"{"message":{"role":"assistant","content":"","thinking":"mull"},"done":false}"#,
            &mut idx,
        );
        assert_eq!(chunks[0].thinking.as_deref(), Some("mull"));
    }

    #[test]
    fn parses_whole_tool_call_as_one_fragment() {
        let mut idx = 0;
        let line = r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"calc","arguments":{"expr":"2+2"}}}]},"done":false}"#;
        let (chunks, _) = parse_line(line, &mut idx);
        let frag = chunks[0].tool_call.as_ref().unwrap();
        assert_eq!(frag.name.as_deref(), Some("calc"));
        let args: serde_json::Value =
            serde_json::from_str(frag.arguments.as_deref().unwrap()).unwrap();
        assert_eq!(args["expr"], "2+2");
    }

    #[test]
    fn done_marker_terminates() {
        let mut idx = 0;
        let (chunks, done) = parse_line(r#"{"done":true}"#, &mut idx);
        assert!(chunks.is_empty());
        assert!(done);
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let mut idx = 0;
        let (chunks, done) = parse_line("not json", &mut idx);
        assert!(chunks.is_empty());
        assert!(!done);
    }

    #[test]
    fn sequential_tool_calls_get_distinct_indices() {
        let mut idx = 0;
        let line = r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"a","arguments":{}}},{"function":{"name":"b","arguments":{}}}]},"done":false}"#;
        let (chunks, _) = parse_line(line, &mut idx);
        let i0 = chunks[0].tool_call.as_ref().unwrap().index;
        let i1 = chunks[1].tool_call.as_ref().unwrap().index;
        assert_ne!(i0, i1);
    }

    #[test]
    fn wire_message_includes_tool_calls() {
        let mut msg = ChatMessage::assistant("checking");
        msg.tool_calls = Some(vec![crate::model::ToolCall {
            id: "c1".into(),
            name: "calc".into(),
            arguments: serde_json::json!({"expr":"1"}),
        }]);
        let wire = wire_message(&msg);
        assert_eq!(wire["role"], "assistant");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "calc");
    }
}
