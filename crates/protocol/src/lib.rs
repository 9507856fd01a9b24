//! Gateway WebSocket/RPC protocol definitions.
//!
//! Protocol version 3. All communication uses JSON text frames over WebSocket.
//!
//! Frame types:
//! - `req`   — client → gateway RPC call
//! - `res`   — gateway → client RPC result
//! - `event` — gateway → client server-push

use serde::{Deserialize, Serialize};

pub mod codec;

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 3;
pub const MAX_PAYLOAD_BYTES: usize = 25 * 1024 * 1024; // 25 MiB
pub const MAX_BUFFERED_BYTES: usize = 50 * 1024 * 1024; // 50 MiB
/// Depth of the per-connection outbox channel. Runtimes without a
/// `bufferedAmount` equivalent model backpressure as a bounded channel.
pub const OUTBOX_DEPTH: usize = 512;
pub const TICK_INTERVAL_MS: u64 = 30_000; // 30s
pub const HEALTH_REFRESH_INTERVAL_MS: u64 = 60_000; // 60s
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000; // 10s
pub const DEDUPE_TTL_MS: u64 = 300_000; // 5 min
pub const DEDUPE_MAX_ENTRIES: usize = 1_000;
pub const AGENT_WAIT_TIMEOUT_MS: u64 = 60_000;
pub const CHAT_DELTA_THROTTLE_MS: u64 = 150;
pub const MAIN_SESSION_KEY: &str = "main";

// ── WebSocket close codes ────────────────────────────────────────────────────

pub mod close_codes {
    /// Handshake failure or slow consumer.
    pub const POLICY: u16 = 1008;
    /// Inbound frame exceeded the payload ceiling.
    pub const TOO_LARGE: u16 = 1009;
    /// Server restart / shutdown.
    pub const RESTART: u16 = 1012;
}

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const AGENT_TIMEOUT: &str = "AGENT_TIMEOUT";
    pub const NOT_LINKED: &str = "NOT_LINKED";
    pub const NOT_PAIRED: &str = "NOT_PAIRED";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
}

// ── Error shape ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_REQUEST, message)
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Discriminated union of all frame types on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

/// Client → gateway RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// Gateway → client RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }

    pub fn into_frame(self) -> Frame {
        Frame::Response(self)
    }
}

/// Gateway → client server-push event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Global broadcast sequence number; absent on targeted pre-handshake
    /// frames (`hello`, `connect.challenge`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(rename = "stateVersion", skip_serializing_if = "Option::is_none")]
    pub state_version: Option<StateVersion>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value, seq: u64) -> Self {
        Self {
            event: event.into(),
            payload: Some(payload),
            seq: Some(seq),
            state_version: None,
        }
    }

    /// Targeted frame with no broadcast sequence (pre-handshake greetings).
    pub fn unsequenced(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            payload: Some(payload),
            seq: None,
            state_version: None,
        }
    }

    pub fn into_frame(self) -> Frame {
        Frame::Event(self)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StateVersion {
    pub presence: u64,
    pub health: u64,
}

// ── Connect handshake ────────────────────────────────────────────────────────

/// Parameters sent by the client in the initial `connect` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "minProtocol")]
    pub min_protocol: u32,
    #[serde(rename = "maxProtocol")]
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "deviceFamily", skip_serializing_if = "Option::is_none")]
    pub device_family: Option<String>,
    #[serde(rename = "modelIdentifier", skip_serializing_if = "Option::is_none")]
    pub model_identifier: Option<String>,
    #[serde(rename = "instanceId", skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// One authenticated connection, as seen by peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    pub host: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    pub ts: u64,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
}

/// Sent by the gateway as the `connect` response payload after a successful
/// handshake. The authoritative snapshot for a newly-authenticated client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloOk {
    pub r#type: String, // always "hello-ok"
    pub protocol: u32,
    pub server: ServerInfo,
    pub features: Features,
    pub snapshot: Snapshot,
    pub policy: Policy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    #[serde(rename = "connId")]
    pub conn_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub presence: Vec<PresenceEntry>,
    pub health: serde_json::Value,
    #[serde(rename = "stateVersion")]
    pub state_version: StateVersion,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
    #[serde(rename = "authMode")]
    pub auth_mode: String,
    #[serde(rename = "sessionDefaults")]
    pub session_defaults: SessionDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDefaults {
    #[serde(rename = "mainSessionKey")]
    pub main_session_key: String,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            main_session_key: MAIN_SESSION_KEY.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    #[serde(rename = "maxPayload")]
    pub max_payload: usize,
    #[serde(rename = "maxBufferedBytes")]
    pub max_buffered_bytes: usize,
    #[serde(rename = "tickIntervalMs")]
    pub tick_interval_ms: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_BYTES,
            max_buffered_bytes: MAX_BUFFERED_BYTES,
            tick_interval_ms: TICK_INTERVAL_MS,
        }
    }
}

// ── Known events ─────────────────────────────────────────────────────────────

pub const KNOWN_EVENTS: &[&str] = &[
    "hello",
    "connect.challenge",
    "tick",
    "shutdown",
    "agent",
    "chat",
    "presence",
    "health",
];

// ── Method registry surface ──────────────────────────────────────────────────

/// Methods with real implementations behind the router.
pub const REAL_METHODS: &[&str] = &[
    "connect",
    "chat.send",
    "chat.abort",
    "chat.history",
    "chat.inject",
    "chat.subscribe",
    "agent",
    "agent.wait",
    "sessions.list",
    "sessions.patch",
    "sessions.reset",
    "sessions.delete",
    "send",
    "health",
    "status",
    "system-presence",
    "logs.tail",
    "models.list",
    "config.get",
];

/// Methods registered solely so `features.methods` enumerates the full
/// protocol surface; each returns a fixed stub payload.
pub const STUB_METHODS: &[&str] = &[
    "cron.list",
    "cron.add",
    "cron.remove",
    "cron.run",
    "devices.list",
    "devices.revoke",
    "nodes.list",
    "nodes.invoke",
    "approvals.list",
    "approvals.resolve",
    "tts.speak",
    "tts.voices",
    "wizard.start",
    "wizard.next",
    "wizard.cancel",
    "update.check",
    "skills.list",
    "usage.summary",
];

/// The closed method list returned verbatim in the handshake.
pub fn method_names() -> Vec<String> {
    REAL_METHODS
        .iter()
        .chain(STUB_METHODS.iter())
        .map(|s| (*s).to_string())
        .collect()
}
