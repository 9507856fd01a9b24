//! Shared helpers for in-crate unit tests.

use std::{sync::Arc, time::Instant};

use {tokio::sync::mpsc, tokio_util::sync::CancellationToken};

use sluice_protocol::{ClientInfo, ConnectParams};

use crate::{
    auth::resolve_auth,
    config::GatewayConfig,
    state::{ConnectedClient, GatewayState, Outbound},
};

pub(crate) fn test_state() -> Arc<GatewayState> {
    GatewayState::new(GatewayConfig::default(), resolve_auth(None, None), None)
}

pub(crate) fn test_connect_params() -> ConnectParams {
    ConnectParams {
        min_protocol: 3,
        max_protocol: 3,
        client: ClientInfo {
            id: "test".into(),
            version: "0.0.0".into(),
            platform: "test".into(),
            mode: "operator".into(),
            display_name: None,
            device_family: None,
            model_identifier: None,
            instance_id: None,
        },
        role: None,
        scopes: None,
        auth: None,
    }
}

pub(crate) fn mock_client(conn_id: &str) -> (ConnectedClient, mpsc::Receiver<Outbound>) {
    mock_client_with_capacity(conn_id, 8)
}

pub(crate) fn mock_client_with_capacity(
    conn_id: &str,
    capacity: usize,
) -> (ConnectedClient, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(capacity);
    let client = ConnectedClient {
        conn_id: conn_id.to_string(),
        connect_params: test_connect_params(),
        sender: tx,
        kill: CancellationToken::new(),
        connected_at: Instant::now(),
    };
    (client, rx)
}
