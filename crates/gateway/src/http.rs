//! OpenAI-shaped HTTP surface backed by the run engine.
//!
//! `/v1/chat/completions` is real (unary and SSE); the other HTTP paths are
//! 501 stubs so the method surface is explicit. Anything else falls through
//! to the WebSocket upgrade.

use {
    axum::{
        Json,
        extract::{FromRequestParts, Request, State, WebSocketUpgrade},
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Response},
    },
    serde::Deserialize,
    serde_json::{Value, json},
};

use sluice_protocol::error_codes;

use crate::{
    runs::{RunState, chat_and_wait},
    server::AppState,
    state::unix_now_ms,
};

const DEFAULT_HTTP_SESSION: &str = "http-default";

#[derive(Deserialize)]
pub struct CompletionsRequest {
    #[serde(default)]
    messages: Vec<InboundMessage>,
    #[serde(default)]
    stream: bool,
    user: Option<String>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct InboundMessage {
    role: String,
    #[serde(default)]
    content: Value,
}

impl InboundMessage {
    /// Content arrives as a plain string or as an array of typed blocks.
    fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }
}

pub async fn chat_completions(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CompletionsRequest>,
) -> Response {
    let state = &app.state;

    // Bearer auth applies iff a token is configured.
    if let Some(expected) = &state.auth.token {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"ok": false, "error": {"code": error_codes::INVALID_REQUEST, "message": "invalid bearer token"}})),
            )
                .into_response();
        }
    }

    let session_key = body
        .user
        .clone()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| DEFAULT_HTTP_SESSION.into());

    // System/developer turns become synthetic user entries so the adapter
    // sees them via history.
    for msg in &body.messages {
        if msg.role == "system" || msg.role == "developer" {
            let text = msg.text();
            if !text.is_empty() {
                state
                    .sessions
                    .append(
                        &session_key,
                        sluice_sessions::HistoryEntry::user(
                            format!("[System] {text}"),
                            unix_now_ms(),
                        ),
                    )
                    .await;
            }
        }
    }

    let Some(prompt) = body
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(InboundMessage::text)
        .filter(|t| !t.is_empty())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": {"code": error_codes::INVALID_REQUEST, "message": "no user message"}})),
        )
            .into_response();
    };

    let outcome = chat_and_wait(state, &session_key, &prompt).await;
    if outcome.state == RunState::Error {
        return (
            StatusCode::BAD_GATEWAY,
            Json(json!({"ok": false, "error": {"code": error_codes::UNAVAILABLE, "message": outcome.text}})),
        )
            .into_response();
    }

    let completion_id = format!("chatcmpl_{}", short_id());
    let created = unix_now_ms() / 1000;
    let model = body
        .model
        .clone()
        .or(state.active_model().await)
        .unwrap_or_else(|| "sluice".into());

    let wants_stream = body.stream
        || headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/event-stream"));
    if wants_stream {
        return sse_response(&completion_id, created, &model, &outcome.text);
    }

    Json(json!({
        "id": completion_id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": outcome.text},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0},
    }))
    .into_response()
}

/// Minimum-correct SSE: role chunk, one content chunk carrying the full
/// text, finish chunk, `[DONE]` sentinel.
fn sse_response(id: &str, created: u64, model: &str, text: &str) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        build_sse_body(id, created, model, text),
    )
        .into_response()
}

fn build_sse_body(id: &str, created: u64, model: &str, text: &str) -> String {
    let chunk = |delta: Value, finish: Value| {
        json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish}],
        })
    };
    let mut body = String::new();
    for frame in [
        chunk(json!({"role": "assistant"}), Value::Null),
        chunk(json!({"content": text}), Value::Null),
        chunk(json!({}), json!("stop")),
    ] {
        body.push_str("data: ");
        body.push_str(&frame.to_string());
        body.push_str("\n\n");
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// 501 stub for the documented-but-unimplemented HTTP paths.
pub async fn todo_stub(uri: axum::http::Uri) -> Response {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(json!({"ok": false, "error": {"message": format!("#TODO {}", uri.path())}})),
    )
        .into_response()
}

/// Any unmatched path: accept a WebSocket upgrade, otherwise signal that an
/// upgrade is the only thing served here.
pub async fn fallback(State(app): State<AppState>, request: Request) -> Response {
    let (mut parts, _body) = request.into_parts();
    match WebSocketUpgrade::from_request_parts(&mut parts, &app).await {
        Ok(upgrade) => upgrade.on_upgrade(move |socket| {
            crate::ws::handle_connection(socket, app.state, app.methods)
        }),
        Err(_) => (StatusCode::UPGRADE_REQUIRED, "WebSocket upgrade required").into_response(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn inbound_message_flattens_block_content() {
        let msg: InboundMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "part one"},
                {"type": "text", "text": "part two"},
            ],
        }))
        .unwrap();
        assert_eq!(msg.text(), "part one\npart two");
    }

    #[test]
    fn inbound_message_accepts_plain_string() {
        let msg: InboundMessage =
            serde_json::from_value(json!({"role": "user", "content": "hi"})).unwrap();
        assert_eq!(msg.text(), "hi");
    }

    #[test]
    fn sse_body_has_three_chunks_and_done() {
        let body = build_sse_body("chatcmpl_abc", 1, "demo-1", "hello world");
        let data_lines: Vec<_> = body
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .collect();
        assert_eq!(data_lines.len(), 4);
        assert_eq!(*data_lines.last().unwrap(), "[DONE]");

        let role: Value = serde_json::from_str(data_lines[0]).unwrap();
        assert_eq!(role["object"], "chat.completion.chunk");
        assert_eq!(role["choices"][0]["delta"]["role"], "assistant");

        let content: Value = serde_json::from_str(data_lines[1]).unwrap();
        assert_eq!(content["choices"][0]["delta"]["content"], "hello world");

        let finish: Value = serde_json::from_str(data_lines[2]).unwrap();
        assert_eq!(finish["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn short_id_is_eight_chars() {
        assert_eq!(short_id().len(), 8);
    }
}
