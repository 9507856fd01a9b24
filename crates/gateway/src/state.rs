use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use {
    tokio::sync::{Mutex, RwLock, mpsc},
    tokio_util::sync::CancellationToken,
};

use {
    sluice_agents::{AgentHandler, DemoAdapter},
    sluice_protocol::{ConnectParams, PresenceEntry, StateVersion},
    sluice_sessions::SessionStore,
};

use crate::{
    auth::ResolvedAuth,
    config::GatewayConfig,
    logs::LogRing,
    runs::RunTable,
};

pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Outbound channel ─────────────────────────────────────────────────────────

/// What flows through a connection's outbox to its writer task.
#[derive(Debug)]
pub enum Outbound {
    /// A serialized JSON frame.
    Frame(String),
    /// Close the socket with the given code and reason, then stop writing.
    Close(u16, String),
}

/// Result of a non-blocking enqueue onto a connection's outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The outbox is full; the consumer is not keeping up.
    Full,
    /// The writer task is gone; the connection is closing.
    Closed,
}

// ── Connected client ─────────────────────────────────────────────────────────

/// An authenticated WebSocket client. Connections only enter the registry
/// once the `connect` handshake succeeds.
#[derive(Debug)]
pub struct ConnectedClient {
    pub conn_id: String,
    pub connect_params: ConnectParams,
    /// Bounded outbox drained by this connection's writer task.
    pub sender: mpsc::Sender<Outbound>,
    /// Fired to force-close the connection (slow consumer).
    pub kill: CancellationToken,
    pub connected_at: Instant,
}

impl ConnectedClient {
    /// Enqueue a serialized frame without blocking.
    pub fn send_frame(&self, json: &str) -> SendOutcome {
        match self.sender.try_send(Outbound::Frame(json.to_string())) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    fn presence_entry(&self, host: &str) -> PresenceEntry {
        PresenceEntry {
            instance_id: self.conn_id.clone(),
            host: host.to_string(),
            version: self.connect_params.client.version.clone(),
            platform: self.connect_params.client.platform.clone(),
            mode: self.connect_params.client.mode.clone(),
            ts: unix_now_ms(),
            reason: "connect".into(),
            roles: self.connect_params.role.clone().map(|r| vec![r]),
            scopes: self.connect_params.scopes.clone(),
        }
    }
}

// ── Dedupe cache ─────────────────────────────────────────────────────────────

struct DedupeEntry {
    inserted_at: Instant,
}

/// TTL-based idempotency cache, capacity-bounded with oldest-first eviction.
/// Intentionally not an LRU: fairness matters less than a hard upper bound.
pub struct DedupeCache {
    entries: HashMap<String, DedupeEntry>,
    ttl: std::time::Duration,
    max_entries: usize,
}

impl DedupeCache {
    pub fn new(ttl_ms: u64, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl: std::time::Duration::from_millis(ttl_ms),
            max_entries,
        }
    }

    /// Returns true when the key was already seen within the TTL; otherwise
    /// records it. Expired entries are lazily purged on probe.
    pub fn check_and_insert(&mut self, key: &str) -> bool {
        self.sweep();
        if self.entries.contains_key(key) {
            return true;
        }
        if self.entries.len() >= self.max_entries
            && let Some(oldest_key) = self
                .entries
                .iter()
                .min_by_key(|(_, v)| v.inserted_at)
                .map(|(k, _)| k.clone())
        {
            self.entries.remove(&oldest_key);
        }
        self.entries.insert(key.to_string(), DedupeEntry {
            inserted_at: Instant::now(),
        });
        false
    }

    /// Drop expired entries; also run by the periodic sweeper.
    pub fn sweep(&mut self) {
        let Some(cutoff) = Instant::now().checked_sub(self.ttl) else {
            return;
        };
        self.entries.retain(|_, v| v.inserted_at > cutoff);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Mutable runtime state ────────────────────────────────────────────────────

/// All mutable runtime state behind the single `RwLock` on `GatewayState`.
pub struct GatewayInner {
    /// Authenticated clients, keyed by conn_id.
    pub clients: HashMap<String, ConnectedClient>,
    /// Insertion-ordered presence list; one entry per authenticated client.
    pub presence: Vec<PresenceEntry>,
    pub dedupe: DedupeCache,
    /// Model selected via `/model`; `None` means the adapter default.
    pub active_model: Option<String>,
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in `Arc` for use across tasks.
///
/// Immutable fields and atomics live directly on the struct; mutable runtime
/// state is consolidated in [`GatewayInner`] behind a single `RwLock`.
pub struct GatewayState {
    pub version: String,
    pub hostname: String,
    pub config: GatewayConfig,
    pub auth: ResolvedAuth,
    pub sessions: Arc<SessionStore>,
    pub handler: Arc<dyn AgentHandler>,
    pub runs: RunTable,
    pub logs: LogRing,
    pub started_at: Instant,
    /// Background interval tasks, aborted on shutdown.
    pub tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    pub shutting_down: AtomicBool,

    /// Monotonically increasing sequence counter for broadcast events.
    seq: AtomicU64,
    presence_version: AtomicU64,
    health_version: AtomicU64,

    pub inner: RwLock<GatewayInner>,
}

impl GatewayState {
    pub fn new(
        config: GatewayConfig,
        auth: ResolvedAuth,
        handler: Option<Arc<dyn AgentHandler>>,
    ) -> Arc<Self> {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into());

        let sessions = match &config.log_dir {
            Some(dir) => Arc::new(
                SessionStore::new()
                    .with_disk_log(Arc::new(sluice_sessions::DiskLog::new(dir.clone()))),
            ),
            None => Arc::new(SessionStore::new()),
        };

        Arc::new(Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname,
            auth,
            sessions,
            handler: handler.unwrap_or_else(|| Arc::new(DemoAdapter)),
            runs: RunTable::default(),
            logs: LogRing::default(),
            started_at: Instant::now(),
            tasks: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            presence_version: AtomicU64::new(0),
            health_version: AtomicU64::new(0),
            inner: RwLock::new(GatewayInner {
                clients: HashMap::new(),
                presence: Vec::new(),
                dedupe: DedupeCache::new(config.dedupe_ttl_ms, config.dedupe_max_keys),
                active_model: None,
            }),
            config,
        })
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn state_version(&self) -> StateVersion {
        StateVersion {
            presence: self.presence_version.load(Ordering::Acquire),
            health: self.health_version.load(Ordering::Acquire),
        }
    }

    pub fn bump_health_version(&self) -> u64 {
        self.health_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Register an authenticated client and its presence entry. The version
    /// bump happens inside the same critical section as the presence
    /// mutation so a snapshot can never pair stale state with a fresh
    /// counter.
    pub async fn register_client(
        &self,
        client: ConnectedClient,
    ) -> (Vec<PresenceEntry>, StateVersion) {
        let mut inner = self.inner.write().await;
        let entry = client.presence_entry(&self.hostname);
        inner.presence.push(entry);
        inner.clients.insert(client.conn_id.clone(), client);
        self.presence_version.fetch_add(1, Ordering::AcqRel);
        (inner.presence.clone(), self.state_version())
    }

    /// Remove a client on socket close; no-op for never-authenticated
    /// connections. Returns the new presence list when something changed.
    pub async fn remove_client(
        &self,
        conn_id: &str,
    ) -> Option<(Vec<PresenceEntry>, StateVersion)> {
        let mut inner = self.inner.write().await;
        inner.clients.remove(conn_id)?;
        inner.presence.retain(|p| p.instance_id != conn_id);
        self.presence_version.fetch_add(1, Ordering::AcqRel);
        Some((inner.presence.clone(), self.state_version()))
    }

    pub async fn client_count(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    pub async fn presence_snapshot(&self) -> Vec<PresenceEntry> {
        self.inner.read().await.presence.clone()
    }

    pub async fn active_model(&self) -> Option<String> {
        self.inner.read().await.active_model.clone()
    }

    /// Health payload broadcast periodically and served by `health`.
    pub async fn health_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "ok": true,
            "uptimeMs": self.uptime_ms(),
            "connections": self.client_count().await,
            "runs": self.runs.counts().await,
        })
    }
}
