//! Method router: name → handler dispatch with param validation, the stub
//! registry, and error mapping.
//!
//! Every dispatched request produces exactly one response frame.

use std::{sync::Arc, time::Duration};

use serde_json::{Value, json};

use {
    sluice_protocol::{
        AGENT_WAIT_TIMEOUT_MS, ErrorShape, PROTOCOL_VERSION, RequestFrame, ResponseFrame,
        STUB_METHODS, error_codes, method_names,
    },
    sluice_sessions::{ContentPart, HistoryEntry, Role},
};

use crate::{
    runs::{abort_run, create_run, execute_run, wait_for_run},
    state::{GatewayState, unix_now_ms},
};

/// The closed dispatch surface advertised in the handshake.
pub struct MethodRegistry;

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self
    }

    pub fn method_names(&self) -> Vec<String> {
        method_names()
    }

    /// Dispatch one authenticated request. `connect` is the connection state
    /// machine's business and is rejected here.
    pub async fn dispatch(
        &self,
        state: &Arc<GatewayState>,
        conn_id: &str,
        req: RequestFrame,
    ) -> ResponseFrame {
        if !state.inner.read().await.clients.contains_key(conn_id) {
            return ResponseFrame::err(req.id, ErrorShape::invalid_request("not authenticated"));
        }
        let params = req.params.unwrap_or_else(|| json!({}));
        let result = match req.method.as_str() {
            "connect" => Err(ErrorShape::invalid_request("already connected")),
            "chat.send" => chat_send(state, &params, None).await,
            "agent" => chat_send(state, &params, Some("default")).await,
            "chat.abort" => chat_abort(state, &params).await,
            "chat.history" => chat_history(state, &params).await,
            "chat.inject" => chat_inject(state, &params).await,
            "chat.subscribe" => Ok(json!({"subscribed": true})),
            "agent.wait" => agent_wait(state, &params).await,
            "sessions.list" => Ok(json!({"sessions": state.sessions.list().await})),
            "sessions.patch" => sessions_patch(state, &params).await,
            "sessions.reset" => sessions_reset(state, &params).await,
            "sessions.delete" => sessions_delete(state, &params).await,
            "send" => send_stub(state, &params).await,
            "health" => Ok(health_payload(state).await),
            "status" => Ok(status_payload(state).await),
            "system-presence" => Ok(json!({"presence": state.presence_snapshot().await})),
            "logs.tail" => Ok(logs_tail(state, &params)),
            "models.list" => Ok(models_list(state).await),
            "config.get" => config_get(state),
            name if STUB_METHODS.contains(&name) => Ok(json!({"stub": true, "todo": name})),
            name => Err(ErrorShape::invalid_request(format!("unknown method: {name}"))),
        };
        match result {
            Ok(payload) => ResponseFrame::ok(req.id, payload),
            Err(error) => ResponseFrame::err(req.id, error),
        }
    }
}

type MethodResult = Result<Value, ErrorShape>;

// ── Param helpers ────────────────────────────────────────────────────────────

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, ErrorShape> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ErrorShape::invalid_request(format!("missing '{key}'")))
}

fn optional_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

// ── Chat / runs ──────────────────────────────────────────────────────────────

async fn chat_send(
    state: &Arc<GatewayState>,
    params: &Value,
    default_session: Option<&str>,
) -> MethodResult {
    let session_key = match default_session {
        Some(default) => optional_str(params, "sessionKey").unwrap_or(default).to_string(),
        None => required_str(params, "sessionKey")?.to_string(),
    };
    let message = required_str(params, "message")?.to_string();
    let idempotency_key = required_str(params, "idempotencyKey")?;

    if state
        .inner
        .write()
        .await
        .dedupe
        .check_and_insert(idempotency_key)
    {
        return Err(ErrorShape::invalid_request("Duplicate idempotency key"));
    }

    // The reply goes out synchronously; the run proceeds on its own task.
    let run = create_run(state, &session_key, &message).await;
    let run_id = run.run_id.clone();
    tokio::spawn(execute_run(Arc::clone(state), run));

    Ok(json!({"runId": run_id, "sessionKey": session_key}))
}

async fn chat_abort(state: &Arc<GatewayState>, params: &Value) -> MethodResult {
    let run_id = optional_str(params, "runId");
    let session_key = optional_str(params, "sessionKey");
    match abort_run(state, run_id, session_key).await {
        Ok(run_id) => Ok(json!({"runId": run_id, "aborted": true})),
        Err(message) => Err(ErrorShape::invalid_request(message)),
    }
}

async fn chat_history(state: &Arc<GatewayState>, params: &Value) -> MethodResult {
    let session_key = required_str(params, "sessionKey")?;
    let limit = params
        .get("limit")
        .and_then(Value::as_u64)
        .map(|l| l as usize);
    let entries = state.sessions.history(session_key, limit).await;
    Ok(json!({"sessionKey": session_key, "entries": entries}))
}

async fn chat_inject(state: &Arc<GatewayState>, params: &Value) -> MethodResult {
    let session_key = required_str(params, "sessionKey")?;
    let message = required_str(params, "message")?;
    let role = match optional_str(params, "role") {
        None | Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        Some(other) => {
            return Err(ErrorShape::invalid_request(format!("invalid role: {other}")));
        },
    };
    state
        .sessions
        .append(session_key, HistoryEntry {
            role,
            content: vec![ContentPart::text(message)],
            timestamp: unix_now_ms(),
            stop_reason: None,
            model: None,
            provider: None,
        })
        .await;
    Ok(json!({"injected": true}))
}

async fn agent_wait(state: &Arc<GatewayState>, params: &Value) -> MethodResult {
    let run_id = required_str(params, "runId")?;
    let timeout_ms = params
        .get("timeoutMs")
        .and_then(Value::as_u64)
        .unwrap_or(AGENT_WAIT_TIMEOUT_MS);
    match wait_for_run(state, run_id, Duration::from_millis(timeout_ms)).await {
        Ok(Some(outcome)) => Ok(outcome.to_value()),
        Ok(None) => Err(ErrorShape::new(
            error_codes::AGENT_TIMEOUT,
            format!("run {run_id} did not finish within {timeout_ms}ms"),
        )),
        Err(message) => Err(ErrorShape::invalid_request(message)),
    }
}

// ── Sessions ─────────────────────────────────────────────────────────────────

async fn sessions_patch(state: &Arc<GatewayState>, params: &Value) -> MethodResult {
    let session_key = required_str(params, "sessionKey")?;
    let label = optional_str(params, "label").map(String::from);
    match state.sessions.patch(session_key, label).await {
        Ok(meta) => Ok(json!({"sessionKey": session_key, "meta": meta})),
        Err(e) => Err(ErrorShape::invalid_request(e.to_string())),
    }
}

async fn sessions_reset(state: &Arc<GatewayState>, params: &Value) -> MethodResult {
    let session_key = required_str(params, "sessionKey")?;
    state.sessions.reset(session_key).await;
    Ok(json!({"reset": true}))
}

async fn sessions_delete(state: &Arc<GatewayState>, params: &Value) -> MethodResult {
    let session_key = required_str(params, "sessionKey")?;
    state.sessions.delete(session_key).await;
    Ok(json!({"deleted": true}))
}

// ── Misc ─────────────────────────────────────────────────────────────────────

/// Validates idempotency and acknowledges; performs no outbound routing.
async fn send_stub(state: &Arc<GatewayState>, params: &Value) -> MethodResult {
    let idempotency_key = required_str(params, "idempotencyKey")?;
    if state
        .inner
        .write()
        .await
        .dedupe
        .check_and_insert(idempotency_key)
    {
        return Err(ErrorShape::invalid_request("Duplicate idempotency key"));
    }
    Ok(json!({"sent": true}))
}

async fn health_payload(state: &Arc<GatewayState>) -> Value {
    let mut payload = state.health_payload().await;
    payload["stateVersion"] = serde_json::to_value(state.state_version()).unwrap_or_default();
    payload
}

async fn status_payload(state: &Arc<GatewayState>) -> Value {
    json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "version": &state.version,
        "uptimeMs": state.uptime_ms(),
        "connections": state.client_count().await,
        "runs": state.runs.counts().await,
    })
}

fn logs_tail(state: &Arc<GatewayState>, params: &Value) -> Value {
    let limit = params
        .get("limit")
        .and_then(Value::as_u64)
        .unwrap_or(100) as usize;
    json!({"lines": state.logs.tail(limit)})
}

async fn models_list(state: &Arc<GatewayState>) -> Value {
    json!({
        "models": state.handler.models(),
        "active": state.active_model().await,
    })
}

fn config_get(state: &Arc<GatewayState>) -> MethodResult {
    serde_json::to_value(state.config.public())
        .map_err(|e| ErrorShape::new(error_codes::UNAVAILABLE, e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_util::{mock_client, test_state};

    async fn authed_state() -> (Arc<GatewayState>, String) {
        let state = test_state();
        let (client, rx) = mock_client("conn-1");
        // Leak the receiver so frames can pile up unobserved in tests.
        std::mem::forget(rx);
        state.register_client(client).await;
        (state, "conn-1".to_string())
    }

    fn req(method: &str, params: Value) -> RequestFrame {
        RequestFrame {
            id: "1".into(),
            method: method.into(),
            params: Some(params),
        }
    }

    #[tokio::test]
    async fn unauthenticated_conn_is_rejected() {
        let state = test_state();
        let res = MethodRegistry::new()
            .dispatch(&state, "ghost", req("health", json!({})))
            .await;
        assert!(!res.ok);
        assert_eq!(res.error.unwrap().code, "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn unknown_method_errors_but_replies() {
        let (state, conn) = authed_state().await;
        let res = MethodRegistry::new()
            .dispatch(&state, &conn, req("nope.nope", json!({})))
            .await;
        assert!(!res.ok);
        assert!(res.error.unwrap().message.contains("unknown method"));
    }

    #[tokio::test]
    async fn stub_method_returns_stub_payload() {
        let (state, conn) = authed_state().await;
        let res = MethodRegistry::new()
            .dispatch(&state, &conn, req("cron.list", json!({})))
            .await;
        assert!(res.ok);
        let payload = res.payload.unwrap();
        assert_eq!(payload["stub"], true);
        assert_eq!(payload["todo"], "cron.list");
    }

    #[tokio::test]
    async fn chat_send_replies_with_run_id_and_dedupes() {
        let (state, conn) = authed_state().await;
        let registry = MethodRegistry::new();
        let params = json!({
            "sessionKey": "main",
            "message": "hello",
            "idempotencyKey": "K1",
        });
        let res = registry.dispatch(&state, &conn, req("chat.send", params.clone())).await;
        assert!(res.ok);
        let payload = res.payload.unwrap();
        assert!(payload["runId"].as_str().unwrap().len() > 10);
        assert_eq!(payload["sessionKey"], "main");

        // The user message is visible immediately, even mid-run.
        assert!(state.sessions.message_count("main").await >= 1);

        let dup = registry.dispatch(&state, &conn, req("chat.send", params)).await;
        assert!(!dup.ok);
        assert!(
            dup.error
                .unwrap()
                .message
                .to_lowercase()
                .contains("duplicate")
        );
    }

    #[tokio::test]
    async fn chat_send_requires_session_key_but_agent_defaults_it() {
        let (state, conn) = authed_state().await;
        let registry = MethodRegistry::new();

        let res = registry
            .dispatch(
                &state,
                &conn,
                req("chat.send", json!({"message": "x", "idempotencyKey": "a"})),
            )
            .await;
        assert!(!res.ok);

        let res = registry
            .dispatch(
                &state,
                &conn,
                req("agent", json!({"message": "x", "idempotencyKey": "b"})),
            )
            .await;
        assert!(res.ok);
        assert_eq!(res.payload.unwrap()["sessionKey"], "default");
    }

    #[tokio::test]
    async fn chat_history_returns_entries_in_order() {
        let (state, conn) = authed_state().await;
        state.sessions.append("s", HistoryEntry::user("one", 1)).await;
        state.sessions.append("s", HistoryEntry::user("two", 2)).await;

        let res = MethodRegistry::new()
            .dispatch(&state, &conn, req("chat.history", json!({"sessionKey": "s"})))
            .await;
        let payload = res.payload.unwrap();
        let entries = payload["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["content"][0]["text"], "one");
    }

    #[tokio::test]
    async fn chat_inject_appends_without_running() {
        let (state, conn) = authed_state().await;
        let res = MethodRegistry::new()
            .dispatch(
                &state,
                &conn,
                req(
                    "chat.inject",
                    json!({"sessionKey": "s", "message": "note", "role": "assistant"}),
                ),
            )
            .await;
        assert!(res.ok);
        let history = state.sessions.history("s", None).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::Assistant);
    }

    #[tokio::test]
    async fn sessions_patch_rejects_long_label() {
        let (state, conn) = authed_state().await;
        let res = MethodRegistry::new()
            .dispatch(
                &state,
                &conn,
                req(
                    "sessions.patch",
                    json!({"sessionKey": "s", "label": "x".repeat(100)}),
                ),
            )
            .await;
        assert!(!res.ok);
        assert!(res.error.unwrap().message.contains("label"));
    }

    #[tokio::test]
    async fn send_validates_idempotency_and_acks() {
        let (state, conn) = authed_state().await;
        let registry = MethodRegistry::new();
        let params = json!({"idempotencyKey": "S1", "message": "x"});
        let res = registry.dispatch(&state, &conn, req("send", params.clone())).await;
        assert!(res.ok);
        assert_eq!(res.payload.unwrap()["sent"], true);

        let dup = registry.dispatch(&state, &conn, req("send", params)).await;
        assert!(!dup.ok);
    }

    #[tokio::test]
    async fn agent_wait_times_out_with_agent_timeout_code() {
        let (state, conn) = authed_state().await;
        let run = crate::runs::create_run(&state, "main", "never finishes").await;
        let res = MethodRegistry::new()
            .dispatch(
                &state,
                &conn,
                req("agent.wait", json!({"runId": run.run_id, "timeoutMs": 20})),
            )
            .await;
        assert!(!res.ok);
        assert_eq!(res.error.unwrap().code, "AGENT_TIMEOUT");
    }

    #[tokio::test]
    async fn status_and_health_report_shape() {
        let (state, conn) = authed_state().await;
        let registry = MethodRegistry::new();

        let res = registry.dispatch(&state, &conn, req("status", json!({}))).await;
        let payload = res.payload.unwrap();
        assert_eq!(payload["runtime"], "running");
        assert_eq!(payload["protocol"], 3);

        let res = registry.dispatch(&state, &conn, req("health", json!({}))).await;
        let payload = res.payload.unwrap();
        assert_eq!(payload["ok"], true);
        assert!(payload["stateVersion"]["presence"].is_u64());
    }

    #[tokio::test]
    async fn config_get_is_redacted() {
        let (state, conn) = authed_state().await;
        let res = MethodRegistry::new()
            .dispatch(&state, &conn, req("config.get", json!({})))
            .await;
        let payload = res.payload.unwrap();
        assert!(payload.get("authToken").is_none());
        assert!(payload["maxPayload"].is_u64());
    }
}
