//! Shared harness for the integration tests: a gateway on a free port and a
//! small WebSocket client speaking the frame protocol.
#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    futures_util::{SinkExt, StreamExt},
    serde_json::{Value, json},
    tokio::net::TcpStream,
    tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message,
    },
};

use {
    sluice_agents::AgentHandler,
    sluice_gateway::{
        GatewayConfig, GatewayState, auth::resolve_auth, build_gateway_app,
        methods::MethodRegistry,
    },
};

pub async fn start_server(
    config: GatewayConfig,
    handler: Option<Arc<dyn AgentHandler>>,
) -> (SocketAddr, Arc<GatewayState>) {
    let auth = resolve_auth(config.auth_token.clone(), config.auth_password.clone());
    let state = GatewayState::new(config, auth, handler);
    let methods = Arc::new(MethodRegistry::new());
    let app = build_gateway_app(Arc::clone(&state), methods);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let (stream, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        Self { stream }
    }

    pub async fn send_json(&mut self, value: Value) {
        self.stream
            .send(Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    /// Next text frame as JSON; panics on close or timeout.
    pub async fn recv_json(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(10), self.stream.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("transport error");
            match msg {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    /// Next frame, text or close. Returns `Err(code)` on close.
    pub async fn recv_json_or_close(&mut self) -> Result<Value, Option<u16>> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(10), self.stream.next())
                .await
                .expect("timed out waiting for frame");
            match msg {
                Some(Ok(Message::Text(text))) => {
                    return Ok(serde_json::from_str(text.as_str()).unwrap());
                },
                Some(Ok(Message::Close(frame))) => {
                    return Err(frame.map(|f| u16::from(f.code)));
                },
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return Err(None),
            }
        }
    }

    /// Skip frames until the response with the given id arrives.
    pub async fn response_for(&mut self, id: &str) -> Value {
        loop {
            let frame = self.recv_json().await;
            if frame["type"] == "res" && frame["id"] == id {
                return frame;
            }
        }
    }

    /// Skip frames until the named event arrives.
    pub async fn next_event(&mut self, event: &str) -> Value {
        loop {
            let frame = self.recv_json().await;
            if frame["type"] == "event" && frame["event"] == event {
                return frame;
            }
        }
    }

    /// Run the full handshake: consume `hello` + `connect.challenge`, send
    /// `connect`, return the `hello-ok` response frame.
    pub async fn handshake(&mut self) -> Value {
        self.handshake_with(json!({
            "minProtocol": 3,
            "maxProtocol": 3,
            "client": {
                "id": "test-client",
                "version": "1.0.0",
                "platform": "test",
                "mode": "operator",
            },
        }))
        .await
    }

    pub async fn handshake_with(&mut self, params: Value) -> Value {
        let hello = self.recv_json().await;
        assert_eq!(hello["event"], "hello");
        let challenge = self.recv_json().await;
        assert_eq!(challenge["event"], "connect.challenge");
        assert!(challenge["payload"]["nonce"].is_string());

        self.send_json(json!({
            "type": "req",
            "id": "connect-1",
            "method": "connect",
            "params": params,
        }))
        .await;
        self.response_for("connect-1").await
    }

    pub async fn request(&mut self, id: &str, method: &str, params: Value) -> Value {
        self.send_json(json!({
            "type": "req",
            "id": id,
            "method": method,
            "params": params,
        }))
        .await;
        self.response_for(id).await
    }
}
