//! Connection state machine: greeting, challenge, connect, presence, and
//! the failure paths that close the socket.

mod common;

use serde_json::json;

use {common::WsClient, sluice_gateway::GatewayConfig};

#[tokio::test]
async fn handshake_happy_path_returns_hello_ok_and_presence() {
    let (addr, _state) = common::start_server(GatewayConfig::default(), None).await;
    let mut client = WsClient::connect(addr).await;

    let res = client.handshake().await;
    assert_eq!(res["ok"], true);
    let payload = &res["payload"];
    assert_eq!(payload["type"], "hello-ok");
    assert_eq!(payload["protocol"], 3);
    assert!(
        payload["features"]["methods"]
            .as_array()
            .unwrap()
            .iter()
            .any(|m| m == "chat.send")
    );
    assert_eq!(payload["snapshot"]["presence"].as_array().unwrap().len(), 1);
    assert_eq!(payload["snapshot"]["authMode"], "none");
    assert_eq!(
        payload["snapshot"]["sessionDefaults"]["mainSessionKey"],
        "main"
    );

    // The presence broadcast lands on the newly-authenticated client too.
    let presence = client.next_event("presence").await;
    assert_eq!(presence["payload"]["presence"].as_array().unwrap().len(), 1);
    assert!(presence["seq"].is_u64());
    assert_eq!(presence["stateVersion"]["presence"], 1);
}

#[tokio::test]
async fn protocol_mismatch_errors_and_closes_1008() {
    let (addr, _state) = common::start_server(GatewayConfig::default(), None).await;
    let mut client = WsClient::connect(addr).await;

    let res = client
        .handshake_with(json!({
            "minProtocol": 99,
            "maxProtocol": 99,
            "client": {"id": "t", "version": "1", "platform": "t", "mode": "operator"},
        }))
        .await;
    assert_eq!(res["ok"], false);
    assert!(
        res["error"]["message"]
            .as_str()
            .unwrap()
            .to_lowercase()
            .contains("protocol")
    );

    match client.recv_json_or_close().await {
        Err(Some(code)) => assert_eq!(code, 1008),
        other => panic!("expected close 1008, got {other:?}"),
    }
}

#[tokio::test]
async fn wrong_token_is_rejected() {
    let config = GatewayConfig {
        auth_token: Some("right-token".into()),
        ..Default::default()
    };
    let (addr, _state) = common::start_server(config, None).await;
    let mut client = WsClient::connect(addr).await;

    let res = client
        .handshake_with(json!({
            "minProtocol": 3,
            "maxProtocol": 3,
            "client": {"id": "t", "version": "1", "platform": "t", "mode": "operator"},
            "auth": {"token": "wrong-token"},
        }))
        .await;
    assert_eq!(res["ok"], false);
    assert!(
        res["error"]["message"]
            .as_str()
            .unwrap()
            .contains("authentication failed")
    );
}

#[tokio::test]
async fn correct_token_is_accepted() {
    let config = GatewayConfig {
        auth_token: Some("right-token".into()),
        ..Default::default()
    };
    let (addr, _state) = common::start_server(config, None).await;
    let mut client = WsClient::connect(addr).await;

    let res = client
        .handshake_with(json!({
            "minProtocol": 3,
            "maxProtocol": 3,
            "client": {"id": "t", "version": "1", "platform": "t", "mode": "operator"},
            "auth": {"token": "right-token"},
        }))
        .await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["snapshot"]["authMode"], "token");
}

#[tokio::test]
async fn non_connect_first_request_closes_1008() {
    let (addr, _state) = common::start_server(GatewayConfig::default(), None).await;
    let mut client = WsClient::connect(addr).await;

    // Swallow greeting + challenge, then misbehave.
    client.recv_json().await;
    client.recv_json().await;
    client
        .send_json(json!({"type": "req", "id": "1", "method": "health"}))
        .await;

    let res = client.recv_json().await;
    assert_eq!(res["ok"], false);

    match client.recv_json_or_close().await {
        Err(Some(code)) => assert_eq!(code, 1008),
        other => panic!("expected close 1008, got {other:?}"),
    }
}

#[tokio::test]
async fn peer_disconnect_is_observable_as_presence_shrink() {
    let (addr, _state) = common::start_server(GatewayConfig::default(), None).await;

    let mut watcher = WsClient::connect(addr).await;
    watcher.handshake().await;
    watcher.next_event("presence").await;

    let mut peer = WsClient::connect(addr).await;
    peer.handshake().await;
    let grown = watcher.next_event("presence").await;
    assert_eq!(grown["payload"]["presence"].as_array().unwrap().len(), 2);

    drop(peer);
    let shrunk = watcher.next_event("presence").await;
    assert_eq!(shrunk["payload"]["presence"].as_array().unwrap().len(), 1);
    assert!(
        shrunk["stateVersion"]["presence"].as_u64().unwrap()
            > grown["stateVersion"]["presence"].as_u64().unwrap()
    );
}

#[tokio::test]
async fn unknown_method_after_handshake_keeps_connection_open() {
    let (addr, _state) = common::start_server(GatewayConfig::default(), None).await;
    let mut client = WsClient::connect(addr).await;
    client.handshake().await;

    let res = client.request("9", "no.such.method", json!({})).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "INVALID_REQUEST");

    // Still alive: a health call round-trips.
    let res = client.request("10", "health", json!({})).await;
    assert_eq!(res["ok"], true);
}

#[tokio::test]
async fn shutdown_drain_notifies_before_close() {
    let (addr, state) = common::start_server(GatewayConfig::default(), None).await;
    let mut client = WsClient::connect(addr).await;
    client.handshake().await;

    sluice_gateway::server::drain(&state).await;

    let shutdown = client.next_event("shutdown").await;
    assert_eq!(shutdown["payload"]["reason"], "server_stop");

    match client.recv_json_or_close().await {
        Err(Some(code)) => assert_eq!(code, 1012),
        Err(None) => {}, // close without frame is acceptable transport behavior
        Ok(frame) => panic!("expected close after shutdown, got {frame}"),
    }
}
