//! Keyword-matched demo adapter.
//!
//! Usable with no backend configured, and the reference implementation of
//! the adapter contract: it paces output per word to exercise the throttled
//! delta path, and its `weather` path performs a synthetic tool round-trip.

use std::time::Duration;

use {async_trait::async_trait, serde_json::json};

use sluice_sessions::{ContentPart, ToolCallStatus};

use crate::{
    AgentError,
    handler::{AgentHandler, RunContext, RunOutput, streams},
};

pub const DEMO_MODEL: &str = "demo-1";

/// Per-word pacing; long enough that a multi-sentence reply spans several
/// 150 ms delta windows.
const WORD_PACE: Duration = Duration::from_millis(24);

const WEATHER_TABLE: &str = "Here is the current outlook:\n\n\
| City | Conditions | High | Low |\n\
|------|------------|------|-----|\n\
| Lisbon | Sunny | 24°C | 17°C |\n\
| London | Overcast | 18°C | 12°C |\n\
| Tokyo | Light rain | 21°C | 16°C |\n\n\
Data via web_search.";

const HELP_TEXT: &str = "I am the demo assistant. Try asking about the \
weather, or say hello. Configure a real backend to go further.";

#[derive(Default)]
pub struct DemoAdapter;

#[async_trait]
impl AgentHandler for DemoAdapter {
    async fn run(&self, ctx: &RunContext) -> Result<RunOutput, AgentError> {
        ctx.sink
            .agent(streams::LIFECYCLE, json!({"phase": "start"}))
            .await;

        let lower = ctx.message.to_lowercase();
        if lower.contains("weather") {
            return self.weather(ctx).await;
        }

        let reply = if lower.contains("hello") || lower.contains("hi") {
            "Hello! I am the demo assistant. Ask me about the weather to see a tool call in action."
        } else if lower.contains("help") {
            HELP_TEXT
        } else {
            "I am a demo assistant without a real model behind me. I can say hello, \
             show you the weather, or explain myself if you ask for help."
        };

        match self.stream_text(ctx, reply).await? {
            Some(text) => Ok(RunOutput::Completed {
                content: vec![ContentPart::text(text.clone())],
                text,
            }),
            None => Ok(RunOutput::Aborted),
        }
    }

    fn models(&self) -> Vec<String> {
        vec![DEMO_MODEL.to_string()]
    }
}

impl DemoAdapter {
    /// Stream `reply` word by word. Returns `None` when cancellation was
    /// observed mid-stream.
    async fn stream_text(
        &self,
        ctx: &RunContext,
        reply: &str,
    ) -> Result<Option<String>, AgentError> {
        let mut acc = String::new();
        for word in reply.split_inclusive(' ') {
            if ctx.cancelled() {
                return Ok(None);
            }
            acc.push_str(word);
            ctx.sink.set_accumulated(&acc);
            ctx.sink
                .agent(streams::ASSISTANT, json!({"text": &acc, "delta": word}))
                .await;
            ctx.sink.chat_delta(&acc, false).await;
            tokio::time::sleep(WORD_PACE).await;
        }
        ctx.sink.chat_delta(&acc, true).await;
        Ok(Some(acc))
    }

    async fn weather(&self, ctx: &RunContext) -> Result<RunOutput, AgentError> {
        let call_id = format!("call_{}", uuid::Uuid::new_v4().simple());
        let args = json!({"query": "current weather"});
        ctx.sink
            .agent(
                streams::TOOL,
                json!({
                    "phase": "start",
                    "name": "web_search",
                    "toolCallId": call_id.clone(),
                    "args": args.clone(),
                }),
            )
            .await;
        // Simulated search latency; a cancellation here aborts before any
        // assistant text.
        tokio::time::sleep(Duration::from_millis(60)).await;
        if ctx.cancelled() {
            return Ok(RunOutput::Aborted);
        }
        let result = json!({
            "results": [
                {"city": "Lisbon", "conditions": "Sunny"},
                {"city": "London", "conditions": "Overcast"},
                {"city": "Tokyo", "conditions": "Light rain"},
            ]
        });
        ctx.sink
            .agent(
                streams::TOOL,
                json!({
                    "phase": "result",
                    "name": "web_search",
                    "toolCallId": call_id.clone(),
                    "result": result.clone(),
                    "isError": false,
                }),
            )
            .await;

        let Some(text) = self.stream_text(ctx, WEATHER_TABLE).await? else {
            return Ok(RunOutput::Aborted);
        };
        Ok(RunOutput::Completed {
            content: vec![
                ContentPart::ToolCall {
                    name: "web_search".into(),
                    tool_call_id: call_id,
                    arguments: args,
                    status: ToolCallStatus::Success,
                    result: Some(result),
                    result_error: None,
                },
                ContentPart::text(text.clone()),
            ],
            text,
        })
    }
}
