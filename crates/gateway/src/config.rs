//! Gateway configuration. Loading from files or the environment is the
//! caller's concern; this is the injected surface.

use std::path::PathBuf;

use serde::Serialize;

use sluice_protocol::{
    DEDUPE_MAX_ENTRIES, DEDUPE_TTL_MS, HANDSHAKE_TIMEOUT_MS, HEALTH_REFRESH_INTERVAL_MS,
    MAX_PAYLOAD_BYTES, TICK_INTERVAL_MS,
};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub hostname: String,
    pub auth_token: Option<String>,
    pub auth_password: Option<String>,
    pub tick_interval_ms: u64,
    pub health_refresh_interval_ms: u64,
    pub max_payload: usize,
    pub handshake_timeout_ms: u64,
    pub dedupe_max_keys: usize,
    pub dedupe_ttl_ms: u64,
    /// When set, every history append is mirrored to a JSONL file per
    /// (session, UTC day).
    pub log_dir: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 18789,
            hostname: "127.0.0.1".into(),
            auth_token: None,
            auth_password: None,
            tick_interval_ms: TICK_INTERVAL_MS,
            health_refresh_interval_ms: HEALTH_REFRESH_INTERVAL_MS,
            max_payload: MAX_PAYLOAD_BYTES,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT_MS,
            dedupe_max_keys: DEDUPE_MAX_ENTRIES,
            dedupe_ttl_ms: DEDUPE_TTL_MS,
            log_dir: None,
        }
    }
}

/// Redacted view served by `config.get`. Auth material never leaves the
/// process; only whether it is configured.
#[derive(Debug, Serialize)]
pub struct PublicConfig {
    pub port: u16,
    pub hostname: String,
    #[serde(rename = "authConfigured")]
    pub auth_configured: bool,
    #[serde(rename = "tickIntervalMs")]
    pub tick_interval_ms: u64,
    #[serde(rename = "healthRefreshIntervalMs")]
    pub health_refresh_interval_ms: u64,
    #[serde(rename = "maxPayload")]
    pub max_payload: usize,
    #[serde(rename = "handshakeTimeoutMs")]
    pub handshake_timeout_ms: u64,
    #[serde(rename = "dedupeMaxKeys")]
    pub dedupe_max_keys: usize,
    #[serde(rename = "dedupeTtlMs")]
    pub dedupe_ttl_ms: u64,
    #[serde(rename = "logDir", skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
}

impl GatewayConfig {
    pub fn public(&self) -> PublicConfig {
        PublicConfig {
            port: self.port,
            hostname: self.hostname.clone(),
            auth_configured: self.auth_token.is_some() || self.auth_password.is_some(),
            tick_interval_ms: self.tick_interval_ms,
            health_refresh_interval_ms: self.health_refresh_interval_ms,
            max_payload: self.max_payload,
            handshake_timeout_ms: self.handshake_timeout_ms,
            dedupe_max_keys: self.dedupe_max_keys,
            dedupe_ttl_ms: self.dedupe_ttl_ms,
            log_dir: self
                .log_dir
                .as_ref()
                .map(|p| p.display().to_string()),
        }
    }
}
