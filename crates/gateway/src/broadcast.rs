//! Broadcast bus: global-sequence-stamped fan-out to every authenticated
//! connection.
//!
//! Per-connection ordering comes from the bounded outbox each connection
//! drains with a single writer task. Backpressure policy: droppable events
//! are silently skipped for a full outbox; anything else closes the
//! connection as a slow consumer.

use {serde_json::Value, tracing::{debug, warn}};

use sluice_protocol::{EventFrame, Frame, StateVersion};

use crate::state::{GatewayState, SendOutcome, unix_now_ms};

#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastOpts {
    /// Drop for a congested connection instead of closing it. Set for the
    /// periodic noise: tick, health, presence, heartbeat.
    pub drop_if_slow: bool,
    /// Attach the state-version vector (presence/health events).
    pub with_state_version: bool,
}

/// Fan an event out to every authenticated connection, stamping the next
/// global sequence number. Returns that sequence.
pub async fn broadcast(
    state: &GatewayState,
    event: &str,
    payload: Value,
    opts: BroadcastOpts,
) -> u64 {
    let seq = state.next_seq();
    let mut frame = EventFrame::new(event, payload, seq);
    if opts.with_state_version {
        frame.state_version = Some(state.state_version());
    }
    let json = match serde_json::to_string(&frame.into_frame()) {
        Ok(j) => j,
        Err(e) => {
            warn!(event, "failed to serialize broadcast frame: {e}");
            return seq;
        },
    };

    let inner = state.inner.read().await;
    for client in inner.clients.values() {
        match client.send_frame(&json) {
            SendOutcome::Sent => {},
            SendOutcome::Closed => {},
            SendOutcome::Full => {
                if opts.drop_if_slow {
                    debug!(conn_id = %client.conn_id, event, "dropping event for slow consumer");
                } else {
                    warn!(conn_id = %client.conn_id, event, "closing slow consumer");
                    client.kill.cancel();
                }
            },
        }
    }
    seq
}

/// Targeted delivery of an already-built frame; failures are swallowed (the
/// connection will shortly close).
pub async fn send_to(state: &GatewayState, conn_id: &str, frame: Frame) {
    let json = match serde_json::to_string(&frame) {
        Ok(j) => j,
        Err(e) => {
            warn!("failed to serialize frame: {e}");
            return;
        },
    };
    let inner = state.inner.read().await;
    if let Some(client) = inner.clients.get(conn_id)
        && client.send_frame(&json) == SendOutcome::Full
    {
        client.kill.cancel();
    }
}

/// Broadcast the presence list after a change. The caller passes the
/// snapshot taken inside the mutating critical section.
pub async fn broadcast_presence(
    state: &GatewayState,
    presence: Vec<sluice_protocol::PresenceEntry>,
    version: StateVersion,
) {
    let seq = state.next_seq();
    let mut frame = EventFrame::new(
        "presence",
        serde_json::json!({"presence": presence}),
        seq,
    );
    frame.state_version = Some(version);
    let json = match serde_json::to_string(&frame.into_frame()) {
        Ok(j) => j,
        Err(e) => {
            warn!("failed to serialize presence frame: {e}");
            return;
        },
    };
    let inner = state.inner.read().await;
    for client in inner.clients.values() {
        if client.send_frame(&json) == SendOutcome::Full {
            // Presence is droppable noise.
            debug!(conn_id = %client.conn_id, "dropping presence for slow consumer");
        }
    }
}

pub async fn broadcast_tick(state: &GatewayState) {
    broadcast(
        state,
        "tick",
        serde_json::json!({"ts": unix_now_ms()}),
        BroadcastOpts {
            drop_if_slow: true,
            with_state_version: false,
        },
    )
    .await;
}

pub async fn broadcast_health(state: &GatewayState) {
    state.bump_health_version();
    let payload = state.health_payload().await;
    broadcast(
        state,
        "health",
        payload,
        BroadcastOpts {
            drop_if_slow: true,
            with_state_version: true,
        },
    )
    .await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        state::Outbound,
        test_util::{mock_client, mock_client_with_capacity, test_state},
    };

    async fn recv_json(
        rx: &mut tokio::sync::mpsc::Receiver<Outbound>,
    ) -> serde_json::Value {
        match rx.recv().await.unwrap() {
            Outbound::Frame(json) => serde_json::from_str(&json).unwrap(),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_stamps_increasing_seq_for_all_clients() {
        let state = test_state();
        let (c1, mut rx1) = mock_client("c1");
        let (c2, mut rx2) = mock_client("c2");
        state.register_client(c1).await;
        state.register_client(c2).await;

        broadcast(&state, "tick", serde_json::json!({}), BroadcastOpts::default()).await;
        broadcast(&state, "tick", serde_json::json!({}), BroadcastOpts::default()).await;

        let a1 = recv_json(&mut rx1).await;
        let a2 = recv_json(&mut rx1).await;
        assert_eq!(a1["type"], "event");
        assert!(a1["seq"].as_u64().unwrap() < a2["seq"].as_u64().unwrap());

        let b1 = recv_json(&mut rx2).await;
        assert_eq!(b1["seq"], a1["seq"]);
    }

    #[tokio::test]
    async fn droppable_event_skips_slow_consumer_without_killing() {
        let state = test_state();
        let (client, _rx) = mock_client_with_capacity("slow", 1);
        let kill = client.kill.clone();
        state.register_client(client).await;

        // Fill the outbox, then broadcast a droppable event.
        broadcast(&state, "tick", serde_json::json!({}), BroadcastOpts {
            drop_if_slow: true,
            with_state_version: false,
        })
        .await;
        broadcast(&state, "tick", serde_json::json!({}), BroadcastOpts {
            drop_if_slow: true,
            with_state_version: false,
        })
        .await;
        assert!(!kill.is_cancelled());
    }

    #[tokio::test]
    async fn non_droppable_event_kills_slow_consumer() {
        let state = test_state();
        let (client, _rx) = mock_client_with_capacity("slow", 1);
        let kill = client.kill.clone();
        state.register_client(client).await;

        broadcast(&state, "chat", serde_json::json!({}), BroadcastOpts::default()).await;
        broadcast(&state, "chat", serde_json::json!({}), BroadcastOpts::default()).await;
        assert!(kill.is_cancelled());
    }

    #[tokio::test]
    async fn health_broadcast_bumps_version_and_attaches_it() {
        let state = test_state();
        let (client, mut rx) = mock_client("c");
        state.register_client(client).await;

        let before = state.state_version().health;
        broadcast_health(&state).await;
        let frame = recv_json(&mut rx).await;
        assert_eq!(frame["event"], "health");
        assert_eq!(frame["stateVersion"]["health"], before + 1);
        assert_eq!(frame["payload"]["ok"], true);
    }
}
