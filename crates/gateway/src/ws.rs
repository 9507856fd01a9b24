//! Per-socket connection lifecycle: greeting → challenge → connect →
//! authenticated RPC.
//!
//! Each connection runs two tasks: this read loop and a writer task that
//! drains the bounded outbox. All outbound traffic (responses, broadcasts,
//! close frames) goes through the outbox so per-connection ordering holds.

use std::{sync::Arc, time::Duration};

use {
    axum::extract::ws::{CloseFrame, Message, WebSocket},
    futures_util::{SinkExt, StreamExt},
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
};

use sluice_protocol::{
    ConnectParams, ErrorShape, EventFrame, Features, Frame, HelloOk, KNOWN_EVENTS,
    OUTBOX_DEPTH, PROTOCOL_VERSION, Policy, RequestFrame, ResponseFrame, ServerInfo, Snapshot,
    close_codes,
    codec::{FrameError, encode_frame, parse_frame},
};

use crate::{
    broadcast::broadcast_presence,
    methods::MethodRegistry,
    state::{ConnectedClient, GatewayState, Outbound, unix_now_ms},
};

/// Outcome of handling one inbound message.
enum Flow {
    Continue,
    Close,
}

pub async fn handle_connection(
    socket: WebSocket,
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<Outbound>(OUTBOX_DEPTH);
    let kill = CancellationToken::new();

    // Writer task: the only owner of the sink half. A fired kill token
    // closes the socket as a slow consumer.
    let writer_kill = kill.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = writer_kill.cancelled() => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_codes::POLICY,
                            reason: "slow consumer".into(),
                        })))
                        .await;
                    break;
                }
                next = outbox_rx.recv() => match next {
                    Some(Outbound::Frame(json)) => {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    },
                    Some(Outbound::Close(code, reason)) => {
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    },
                    None => break,
                },
            }
        }
    });

    // Greeting, then the server-initiated challenge. Challenging before
    // accepting any client request closes the nonce-replay window and
    // settles protocol negotiation in one round-trip.
    let nonce = uuid::Uuid::new_v4().to_string();
    send_event(
        &outbox_tx,
        EventFrame::unsequenced(
            "hello",
            serde_json::json!({
                "protocol": PROTOCOL_VERSION,
                "version": &state.version,
            }),
        ),
    )
    .await;
    send_event(
        &outbox_tx,
        EventFrame::unsequenced(
            "connect.challenge",
            serde_json::json!({"nonce": nonce, "ts": unix_now_ms()}),
        ),
    )
    .await;

    let mut authenticated = false;
    let handshake_deadline =
        tokio::time::sleep(Duration::from_millis(state.config.handshake_timeout_ms));
    tokio::pin!(handshake_deadline);

    loop {
        tokio::select! {
            _ = &mut handshake_deadline, if !authenticated => {
                debug!(%conn_id, "handshake deadline expired");
                let _ = outbox_tx
                    .send(Outbound::Close(close_codes::POLICY, "handshake timeout".into()))
                    .await;
                break;
            }
            _ = kill.cancelled() => break,
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let flow = match msg {
                    Message::Text(text) => {
                        handle_text(
                            &state,
                            &methods,
                            &conn_id,
                            &outbox_tx,
                            &kill,
                            &mut authenticated,
                            text.as_str(),
                        )
                        .await
                    },
                    Message::Binary(_) => {
                        // The protocol is JSON text only.
                        if authenticated {
                            send_response(
                                &outbox_tx,
                                ResponseFrame::err(
                                    "?",
                                    ErrorShape::invalid_request("binary frames are not supported"),
                                ),
                            )
                            .await;
                            Flow::Continue
                        } else {
                            send_response(
                                &outbox_tx,
                                ResponseFrame::err(
                                    "?",
                                    ErrorShape::invalid_request("expected connect request"),
                                ),
                            )
                            .await;
                            let _ = outbox_tx
                                .send(Outbound::Close(
                                    close_codes::POLICY,
                                    "handshake failure".into(),
                                ))
                                .await;
                            Flow::Close
                        }
                    },
                    Message::Close(_) => Flow::Close,
                    // Axum answers pings itself.
                    Message::Ping(_) | Message::Pong(_) => Flow::Continue,
                };
                if matches!(flow, Flow::Close) {
                    break;
                }
            }
        }
    }

    // Presence teardown: version bump and snapshot happen inside the state
    // critical section, peers learn about the departure right after.
    if let Some((presence, version)) = state.remove_client(&conn_id).await {
        info!(%conn_id, "client disconnected");
        state.logs.push(format!("connection {conn_id} closed"));
        broadcast_presence(&state, presence, version).await;
    }
    // Let the writer flush whatever is queued (the close frame included).
    // Spawned request tasks may still hold outbox clones (a blocked
    // agent.wait), so don't wait on them forever.
    drop(outbox_tx);
    let mut writer = writer;
    if tokio::time::timeout(Duration::from_secs(5), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
}

async fn send_event(tx: &mpsc::Sender<Outbound>, frame: EventFrame) {
    if let Ok(json) = encode_frame(&frame.into_frame()) {
        let _ = tx.send(Outbound::Frame(json)).await;
    }
}

async fn send_response(tx: &mpsc::Sender<Outbound>, frame: ResponseFrame) {
    if let Ok(json) = encode_frame(&frame.into_frame()) {
        let _ = tx.send(Outbound::Frame(json)).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_text(
    state: &Arc<GatewayState>,
    methods: &Arc<MethodRegistry>,
    conn_id: &str,
    outbox_tx: &mpsc::Sender<Outbound>,
    kill: &CancellationToken,
    authenticated: &mut bool,
    text: &str,
) -> Flow {
    let frame = match parse_frame(text, state.config.max_payload) {
        Ok(frame) => frame,
        Err(FrameError::TooLarge { len, limit }) => {
            send_response(
                outbox_tx,
                ResponseFrame::err(
                    "?",
                    ErrorShape::invalid_request(format!(
                        "payload of {len} bytes exceeds limit of {limit}"
                    )),
                ),
            )
            .await;
            let _ = outbox_tx
                .send(Outbound::Close(close_codes::TOO_LARGE, "payload too large".into()))
                .await;
            return Flow::Close;
        },
        Err(FrameError::Invalid(message)) => {
            send_response(
                outbox_tx,
                ResponseFrame::err("?", ErrorShape::invalid_request(message)),
            )
            .await;
            if *authenticated {
                return Flow::Continue;
            }
            // Pre-handshake misuse closes the socket.
            let _ = outbox_tx
                .send(Outbound::Close(close_codes::POLICY, "handshake failure".into()))
                .await;
            return Flow::Close;
        },
    };

    if !*authenticated {
        return handle_pre_auth_frame(state, conn_id, outbox_tx, kill, authenticated, frame).await;
    }

    match frame {
        Frame::Request(req) => {
            // Requests run concurrently so a blocked `agent.wait` never
            // stalls the connection; responses may arrive out of request
            // order.
            let state = Arc::clone(state);
            let methods = Arc::clone(methods);
            let conn_id = conn_id.to_string();
            let outbox_tx = outbox_tx.clone();
            tokio::spawn(async move {
                let response = methods.dispatch(&state, &conn_id, req).await;
                if let Ok(json) = encode_frame(&response.into_frame()) {
                    let _ = outbox_tx.send(Outbound::Frame(json)).await;
                }
            });
            Flow::Continue
        },
        // Client-originated responses and events have no meaning here.
        Frame::Response(_) | Frame::Event(_) => Flow::Continue,
    }
}

/// In the challenged state the first frame must be a `connect` request.
async fn handle_pre_auth_frame(
    state: &Arc<GatewayState>,
    conn_id: &str,
    outbox_tx: &mpsc::Sender<Outbound>,
    kill: &CancellationToken,
    authenticated: &mut bool,
    frame: Frame,
) -> Flow {
    let req = match frame {
        Frame::Request(req) if req.method == "connect" => req,
        Frame::Request(req) => {
            send_response(
                outbox_tx,
                ResponseFrame::err(
                    req.id,
                    ErrorShape::invalid_request("connect must be the first request"),
                ),
            )
            .await;
            let _ = outbox_tx
                .send(Outbound::Close(close_codes::POLICY, "handshake failure".into()))
                .await;
            return Flow::Close;
        },
        Frame::Response(_) | Frame::Event(_) => {
            send_response(
                outbox_tx,
                ResponseFrame::err("?", ErrorShape::invalid_request("expected connect request")),
            )
            .await;
            let _ = outbox_tx
                .send(Outbound::Close(close_codes::POLICY, "handshake failure".into()))
                .await;
            return Flow::Close;
        },
    };

    match try_connect(state, conn_id, outbox_tx, kill, &req).await {
        Ok(hello_ok) => {
            *authenticated = true;
            send_response(
                outbox_tx,
                ResponseFrame::ok(
                    req.id,
                    serde_json::to_value(hello_ok).unwrap_or_default(),
                ),
            )
            .await;
            // Presence goes to all authenticated peers, the new client
            // included.
            let presence = state.presence_snapshot().await;
            let version = state.state_version();
            broadcast_presence(state, presence, version).await;
            info!(%conn_id, "client authenticated");
            state.logs.push(format!("connection {conn_id} authenticated"));
            Flow::Continue
        },
        Err(error) => {
            send_response(outbox_tx, ResponseFrame::err(req.id, error)).await;
            let _ = outbox_tx
                .send(Outbound::Close(close_codes::POLICY, "handshake failure".into()))
                .await;
            Flow::Close
        },
    }
}

async fn try_connect(
    state: &Arc<GatewayState>,
    conn_id: &str,
    outbox_tx: &mpsc::Sender<Outbound>,
    kill: &CancellationToken,
    req: &RequestFrame,
) -> Result<HelloOk, ErrorShape> {
    let params: ConnectParams =
        serde_json::from_value(req.params.clone().unwrap_or_default())
            .map_err(|e| ErrorShape::invalid_request(format!("invalid connect params: {e}")))?;

    if params.client.id.is_empty() || params.client.version.is_empty() {
        return Err(ErrorShape::invalid_request(
            "client.id and client.version are required",
        ));
    }
    if params.min_protocol > PROTOCOL_VERSION || params.max_protocol < PROTOCOL_VERSION {
        return Err(ErrorShape::invalid_request(format!(
            "unsupported protocol range [{}, {}], server speaks protocol {}",
            params.min_protocol, params.max_protocol, PROTOCOL_VERSION
        )));
    }
    state
        .auth
        .check(params.auth.as_ref())
        .map_err(|reason| ErrorShape::invalid_request(format!("authentication failed: {reason}")))?;

    let client = ConnectedClient {
        conn_id: conn_id.to_string(),
        connect_params: params,
        sender: outbox_tx.clone(),
        kill: kill.clone(),
        connected_at: std::time::Instant::now(),
    };
    let (presence, state_version) = state.register_client(client).await;

    Ok(HelloOk {
        r#type: "hello-ok".into(),
        protocol: PROTOCOL_VERSION,
        server: ServerInfo {
            version: state.version.clone(),
            conn_id: conn_id.to_string(),
        },
        features: Features {
            methods: sluice_protocol::method_names(),
            events: KNOWN_EVENTS.iter().map(|s| s.to_string()).collect(),
        },
        snapshot: Snapshot {
            presence,
            health: state.health_payload().await,
            state_version,
            uptime_ms: state.uptime_ms(),
            auth_mode: state.auth.mode.as_str().into(),
            session_defaults: Default::default(),
        },
        policy: Policy {
            max_payload: state.config.max_payload,
            max_buffered_bytes: sluice_protocol::MAX_BUFFERED_BYTES,
            tick_interval_ms: state.config.tick_interval_ms,
        },
    })
}
