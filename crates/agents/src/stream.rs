//! The streamed-delta translator and multi-turn tool loop shared by every
//! non-trivial adapter.
//!
//! One iteration = one streaming call to the backend. Text and thinking
//! deltas are forwarded as they arrive; tool-call fragments accumulate until
//! the stream ends. A non-empty tool batch is dispatched, its results are
//! appended to the prompt, and the backend is re-entered, until the model
//! stops calling tools or the iteration cap trips.

use {async_trait::async_trait, serde_json::json, tracing::warn};

use sluice_sessions::{ContentPart, ToolCallStatus};

use crate::{
    AgentError, MAX_TOOL_ITERATIONS,
    accumulate::ToolCallAccumulator,
    handler::{RunContext, RunOutput, streams},
    mcp::ToolRouter,
    model::{ChatMessage, StreamChunk, ToolDefinition},
    prompt::build_messages,
};

/// One open streaming response from a backend.
#[async_trait]
pub trait ChunkStream: Send {
    /// The next parsed chunk, or `None` at end of stream.
    async fn next_chunk(&mut self) -> Result<Option<StreamChunk>, AgentError>;
}

/// A backend capable of opening a streaming chat call.
#[async_trait]
pub trait StreamingBackend: Send + Sync {
    async fn open_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<Box<dyn ChunkStream>, AgentError>;
}

/// Drive one run against a streaming backend. Cancellation is observed at
/// every chunk boundary and before every tool call; once observed, nothing
/// further is emitted.
pub async fn run_stream_loop(
    backend: &dyn StreamingBackend,
    model: &str,
    tools: &ToolRouter,
    ctx: &RunContext,
) -> Result<RunOutput, AgentError> {
    let all_tools = tools.definitions().await;
    let mut messages = build_messages(ctx.system_prompt.as_deref(), &ctx.history, &ctx.message);
    let mut content_parts: Vec<ContentPart> = Vec::new();
    let mut final_text = String::new();
    let mut final_thinking = String::new();
    let mut iteration = 0usize;

    ctx.sink.agent(streams::LIFECYCLE, json!({"phase": "start"})).await;

    loop {
        iteration += 1;
        if iteration > MAX_TOOL_ITERATIONS {
            warn!(
                run_id = %ctx.run_id,
                "tool loop exceeded {MAX_TOOL_ITERATIONS} iterations, stopping"
            );
            break;
        }
        if ctx.cancelled() {
            return Ok(RunOutput::Aborted);
        }

        let mut stream = backend.open_stream(model, &messages, &all_tools).await?;
        let mut text_acc = String::new();
        let mut thinking_acc = String::new();
        let mut tool_acc = ToolCallAccumulator::default();

        while let Some(chunk) = stream.next_chunk().await? {
            if ctx.cancelled() {
                return Ok(RunOutput::Aborted);
            }
            if let Some(thinking) = chunk.thinking
                && !thinking.is_empty()
            {
                thinking_acc.push_str(&thinking);
                ctx.sink
                    .agent(
                        streams::REASONING,
                        json!({"text": &thinking_acc, "delta": thinking}),
                    )
                    .await;
            }
            if let Some(text) = chunk.text
                && !text.is_empty()
            {
                text_acc.push_str(&text);
                ctx.sink.set_accumulated(&text_acc);
                ctx.sink
                    .agent(streams::ASSISTANT, json!({"text": &text_acc, "delta": text}))
                    .await;
                ctx.sink.chat_delta(&text_acc, false).await;
            }
            if let Some(fragment) = chunk.tool_call {
                tool_acc.push(fragment);
            }
        }

        if !tool_acc.is_empty() {
            // The model wants tools before producing final text.
            let calls = tool_acc.drain();
            let mut assistant_msg = ChatMessage::assistant(text_acc.clone());
            assistant_msg.tool_calls = Some(calls.clone());
            messages.push(assistant_msg);

            for call in calls {
                if ctx.cancelled() {
                    return Ok(RunOutput::Aborted);
                }
                ctx.sink
                    .agent(
                        streams::TOOL,
                        json!({
                            "phase": "start",
                            "name": call.name.clone(),
                            "toolCallId": call.id.clone(),
                            "args": call.arguments.clone(),
                        }),
                    )
                    .await;
                let outcome = tools.dispatch(&call.name, call.arguments.clone()).await;
                ctx.sink
                    .agent(
                        streams::TOOL,
                        json!({
                            "phase": "result",
                            "name": call.name.clone(),
                            "toolCallId": call.id.clone(),
                            "result": outcome.result.clone(),
                            "isError": outcome.is_error,
                        }),
                    )
                    .await;
                content_parts.push(ContentPart::ToolCall {
                    name: call.name.clone(),
                    tool_call_id: call.id.clone(),
                    arguments: call.arguments,
                    status: if outcome.is_error {
                        ToolCallStatus::Error
                    } else {
                        ToolCallStatus::Success
                    },
                    result: (!outcome.is_error).then(|| outcome.result.clone()),
                    result_error: outcome
                        .is_error
                        .then(|| outcome.result.as_str().unwrap_or("tool error").to_string()),
                });
                let result_text = match outcome.result {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                messages.push(ChatMessage::tool_result(call.id, result_text));
            }
            continue; // re-enter the backend with enriched messages
        }

        // No tool calls this iteration: the model produced its final text.
        if !text_acc.is_empty() {
            ctx.sink.chat_delta(&text_acc, true).await;
        }
        final_text = text_acc;
        final_thinking = thinking_acc;
        break;
    }

    if ctx.cancelled() {
        return Ok(RunOutput::Aborted);
    }
    if !final_thinking.is_empty() {
        content_parts.push(ContentPart::thinking(final_thinking));
    }
    if !final_text.is_empty() {
        content_parts.push(ContentPart::text(final_text.clone()));
    }
    Ok(RunOutput::Completed {
        content: content_parts,
        text: final_text,
    })
}
