//! The OpenAI-shaped HTTP surface: unary completions, SSE, auth, stubs, and
//! the upgrade fallback.

mod common;

use serde_json::{Value, json};

use sluice_gateway::GatewayConfig;

#[tokio::test]
async fn non_streaming_completion_has_openai_shape() {
    let (addr, _state) = common::start_server(GatewayConfig::default(), None).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("http://{addr}/v1/chat/completions"))
        .json(&json!({
            "messages": [{"role": "user", "content": "hello"}],
            "stream": false,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    let body: Value = res.json().await.unwrap();
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl_"));
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert!(
        !body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap()
            .is_empty()
    );
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 0);
}

#[tokio::test]
async fn streaming_completion_emits_sse_chunks_and_done() {
    let (addr, _state) = common::start_server(GatewayConfig::default(), None).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("http://{addr}/v1/chat/completions"))
        .json(&json!({
            "messages": [{"role": "user", "content": "hello"}],
            "stream": true,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert!(
        res.headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("text/event-stream")
    );

    let body = res.text().await.unwrap();
    let data_lines: Vec<&str> = body
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .collect();
    assert!(data_lines.len() >= 3);
    assert_eq!(*data_lines.last().unwrap(), "[DONE]");

    let content_chunk: Value = serde_json::from_str(data_lines[1]).unwrap();
    assert_eq!(content_chunk["object"], "chat.completion.chunk");
    assert!(
        content_chunk["choices"][0]["delta"]["content"]
            .as_str()
            .is_some()
    );
}

#[tokio::test]
async fn system_messages_are_injected_into_the_session() {
    let (addr, state) = common::start_server(GatewayConfig::default(), None).await;
    let client = reqwest::Client::new();

    client
        .post(format!("http://{addr}/v1/chat/completions"))
        .json(&json!({
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hello"},
            ],
            "user": "alice",
        }))
        .send()
        .await
        .unwrap();

    let history = state.sessions.history("alice", None).await;
    // Synthetic system entry, user prompt, assistant reply.
    assert!(history.len() >= 3);
    assert!(history[0].text().starts_with("[System] be terse"));
}

#[tokio::test]
async fn bearer_auth_is_enforced_when_configured() {
    let config = GatewayConfig {
        auth_token: Some("tok".into()),
        ..Default::default()
    };
    let (addr, _state) = common::start_server(config, None).await;
    let client = reqwest::Client::new();
    let body = json!({"messages": [{"role": "user", "content": "hi"}]});

    let res = client
        .post(format!("http://{addr}/v1/chat/completions"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);

    let res = client
        .post(format!("http://{addr}/v1/chat/completions"))
        .bearer_auth("tok")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
}

#[tokio::test]
async fn missing_user_message_is_a_400() {
    let (addr, _state) = common::start_server(GatewayConfig::default(), None).await;
    let res = reqwest::Client::new()
        .post(format!("http://{addr}/v1/chat/completions"))
        .json(&json!({"messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn stub_paths_return_501_with_todo_body() {
    let (addr, _state) = common::start_server(GatewayConfig::default(), None).await;
    let client = reqwest::Client::new();
    for path in ["/v1/responses", "/hooks/wake", "/hooks/agent", "/tools/invoke"] {
        let res = client
            .post(format!("http://{addr}{path}"))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 501, "{path}");
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["ok"], false);
        assert!(body["error"]["message"].as_str().unwrap().starts_with("#TODO"));
    }
}

#[tokio::test]
async fn plain_get_on_unknown_path_is_426() {
    let (addr, _state) = common::start_server(GatewayConfig::default(), None).await;
    let res = reqwest::get(format!("http://{addr}/anything"))
        .await
        .unwrap();
    assert_eq!(res.status(), 426);
}
