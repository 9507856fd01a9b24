//! The run engine: turns one user message into a stream of events and a
//! final history entry.
//!
//! Runs are not tied to their originating socket; they live in the run table
//! for the process lifetime so `agent.wait` always finds them.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    serde::Serialize,
    serde_json::{Value, json},
    tokio::sync::{RwLock, oneshot},
    tokio_util::sync::CancellationToken,
    tracing::{error, info},
};

use {
    sluice_agents::{AgentEventSink, RunContext, RunOutput, streams},
    sluice_protocol::CHAT_DELTA_THROTTLE_MS,
    sluice_sessions::{ContentPart, HistoryEntry},
};

use crate::{
    broadcast::{BroadcastOpts, broadcast},
    state::{GatewayState, unix_now_ms},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Completed,
    Error,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Error => "error",
            RunState::Aborted => "aborted",
        }
    }
}

/// Payload delivered to every `agent.wait` waiter on termination.
#[derive(Debug, Clone)]
pub struct WaitOutcome {
    pub run_id: String,
    pub state: RunState,
    pub text: String,
}

impl WaitOutcome {
    pub fn to_value(&self) -> Value {
        json!({
            "runId": &self.run_id,
            "state": self.state.as_str(),
            "text": &self.text,
        })
    }
}

/// One in-flight (or finished) agent invocation.
pub struct Run {
    pub run_id: String,
    pub session_key: String,
    pub message: String,
    pub created_at: u64,
    pub cancel: CancellationToken,
    /// Per-run event counter, distinct from the broadcast-level sequence.
    seq: AtomicU64,
    state: Mutex<RunState>,
    accumulated: Mutex<String>,
    waiters: Mutex<Vec<oneshot::Sender<WaitOutcome>>>,
    /// Millis timestamp of the last emitted `chat.delta` (throttle state).
    last_delta_ms: AtomicU64,
}

impl Run {
    fn new(session_key: &str, message: &str) -> Arc<Self> {
        Arc::new(Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            session_key: session_key.to_string(),
            message: message.to_string(),
            created_at: unix_now_ms(),
            cancel: CancellationToken::new(),
            seq: AtomicU64::new(0),
            state: Mutex::new(RunState::Running),
            accumulated: Mutex::new(String::new()),
            waiters: Mutex::new(Vec::new()),
            last_delta_ms: AtomicU64::new(0),
        })
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn state(&self) -> RunState {
        self.state.lock().map(|s| *s).unwrap_or(RunState::Error)
    }

    pub fn accumulated_text(&self) -> String {
        self.accumulated.lock().map(|t| t.clone()).unwrap_or_default()
    }

    fn set_accumulated(&self, text: &str) {
        if let Ok(mut acc) = self.accumulated.lock() {
            text.clone_into(&mut acc);
        }
    }

    /// Transition to a terminal state. Returns false when the run was
    /// already terminal; exactly one caller wins.
    fn try_finish(&self, next: RunState) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.is_terminal() {
            return false;
        }
        *state = next;
        true
    }

    fn add_waiter(&self, tx: oneshot::Sender<WaitOutcome>) {
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.push(tx);
        }
    }

    fn resolve_waiters(&self, outcome: &WaitOutcome) {
        let drained = match self.waiters.lock() {
            Ok(mut waiters) => std::mem::take(&mut *waiters),
            Err(_) => return,
        };
        for tx in drained {
            let _ = tx.send(outcome.clone());
        }
    }

    /// Throttle check for `chat.delta`: at most one per window unless forced.
    fn delta_due(&self, force: bool) -> bool {
        let now = unix_now_ms();
        let last = self.last_delta_ms.load(Ordering::Acquire);
        if !force && now.saturating_sub(last) < CHAT_DELTA_THROTTLE_MS {
            return false;
        }
        self.last_delta_ms.store(now, Ordering::Release);
        true
    }
}

// ── Run table ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RunTable {
    runs: RwLock<HashMap<String, Arc<Run>>>,
}

impl RunTable {
    pub async fn insert(&self, run: Arc<Run>) {
        self.runs.write().await.insert(run.run_id.clone(), run);
    }

    pub async fn get(&self, run_id: &str) -> Option<Arc<Run>> {
        self.runs.read().await.get(run_id).cloned()
    }

    /// The most recently created run still running in the session.
    pub async fn latest_running(&self, session_key: &str) -> Option<Arc<Run>> {
        self.runs
            .read()
            .await
            .values()
            .filter(|r| r.session_key == session_key && r.state() == RunState::Running)
            .max_by_key(|r| r.created_at)
            .cloned()
    }

    pub async fn cancel_all(&self) {
        for run in self.runs.read().await.values() {
            if run.state() == RunState::Running {
                run.cancel.cancel();
            }
        }
    }

    pub async fn counts(&self) -> Value {
        let runs = self.runs.read().await;
        let mut running = 0usize;
        let mut completed = 0usize;
        let mut errored = 0usize;
        let mut aborted = 0usize;
        for run in runs.values() {
            match run.state() {
                RunState::Running => running += 1,
                RunState::Completed => completed += 1,
                RunState::Error => errored += 1,
                RunState::Aborted => aborted += 1,
            }
        }
        json!({
            "running": running,
            "completed": completed,
            "error": errored,
            "aborted": aborted,
        })
    }
}

// ── Event sink ───────────────────────────────────────────────────────────────

/// Publishes a run's events onto the broadcast bus, stamping the per-run
/// sequence and maintaining the delta throttle.
pub struct BroadcastSink {
    state: Arc<GatewayState>,
    run: Arc<Run>,
}

impl BroadcastSink {
    pub fn new(state: Arc<GatewayState>, run: Arc<Run>) -> Self {
        Self { state, run }
    }
}

#[async_trait]
impl AgentEventSink for BroadcastSink {
    async fn agent(&self, stream: &str, data: Value) {
        emit_agent_event(&self.state, &self.run, stream, data).await;
    }

    async fn chat_delta(&self, text: &str, force: bool) {
        if !self.run.delta_due(force) {
            return;
        }
        emit_chat_event(
            &self.state,
            &self.run,
            "delta",
            json!({"text": text}),
        )
        .await;
    }

    fn set_accumulated(&self, text: &str) {
        self.run.set_accumulated(text);
    }
}

async fn emit_agent_event(state: &GatewayState, run: &Run, stream: &str, data: Value) {
    let payload = json!({
        "runId": &run.run_id,
        "sessionKey": &run.session_key,
        "seq": run.next_seq(),
        "stream": stream,
        "ts": unix_now_ms(),
        "data": data,
    });
    broadcast(state, "agent", payload, BroadcastOpts::default()).await;
}

async fn emit_chat_event(state: &GatewayState, run: &Run, chat_state: &str, extra: Value) {
    let mut payload = json!({
        "runId": &run.run_id,
        "sessionKey": &run.session_key,
        "seq": run.next_seq(),
        "state": chat_state,
    });
    if let (Some(obj), Some(extra_obj)) = (payload.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            obj.insert(k.clone(), v.clone());
        }
    }
    broadcast(state, "chat", payload, BroadcastOpts::default()).await;
}

// ── Engine entry points ──────────────────────────────────────────────────────

/// Create a run for an already-validated message: append the user entry,
/// register the run, and return it. The reply to the caller must not wait
/// for backend I/O; callers either spawn [`execute_run`] or await it (HTTP).
pub async fn create_run(state: &Arc<GatewayState>, session_key: &str, message: &str) -> Arc<Run> {
    state
        .sessions
        .append(session_key, HistoryEntry::user(message, unix_now_ms()))
        .await;
    let run = Run::new(session_key, message);
    state.runs.insert(Arc::clone(&run)).await;
    state
        .logs
        .push(format!("run {} started in session {session_key}", run.run_id));
    run
}

/// Drive a run to its terminal state. Spawned for WS-initiated runs and
/// awaited directly by the HTTP surface.
pub async fn execute_run(state: Arc<GatewayState>, run: Arc<Run>) {
    let trimmed = run.message.trim();
    if let Some(command) = trimmed.strip_prefix('/') {
        execute_slash_command(&state, &run, command).await;
        return;
    }

    let sink = Arc::new(BroadcastSink::new(Arc::clone(&state), Arc::clone(&run)));
    let ctx = RunContext {
        run_id: run.run_id.clone(),
        session_key: run.session_key.clone(),
        message: run.message.clone(),
        history: state.sessions.full_history(&run.session_key).await,
        model: state.active_model().await,
        system_prompt: None,
        cancel: run.cancel.clone(),
        sink,
    };

    match state.handler.run(&ctx).await {
        Ok(RunOutput::Completed { content, text }) => {
            finish_run(&state, &run, RunState::Completed, None, Some((content, text))).await;
        },
        Ok(RunOutput::Aborted) => {
            finish_run(&state, &run, RunState::Aborted, None, None).await;
        },
        Err(e) => {
            error!(run_id = %run.run_id, "agent run failed: {e}");
            finish_run(&state, &run, RunState::Error, Some(e.to_string()), None).await;
        },
    }
}

/// Slash commands are answered by the engine itself; the backend is never
/// charged for them.
async fn execute_slash_command(state: &Arc<GatewayState>, run: &Arc<Run>, command: &str) {
    let sink = BroadcastSink::new(Arc::clone(state), Arc::clone(run));
    sink.agent(streams::LIFECYCLE, json!({"phase": "start"})).await;

    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let rest = parts.collect::<Vec<_>>().join(" ");

    let reply = match name {
        "new" => {
            state.sessions.reset(&run.session_key).await;
            "Started a fresh conversation. Previous history in this session is gone.".to_string()
        },
        "model" => {
            if rest.is_empty() {
                match state.active_model().await {
                    Some(model) => format!("Active model: {model}"),
                    None => format!(
                        "Active model: {} (adapter default)",
                        state.handler.models().first().cloned().unwrap_or_else(|| "unknown".into())
                    ),
                }
            } else {
                state.inner.write().await.active_model = Some(rest.clone());
                format!("Model set to {rest}")
            }
        },
        "models" => {
            let models = state.handler.models();
            if models.is_empty() {
                "No models advertised by the configured backend.".to_string()
            } else {
                let mut out = String::from("Available models:\n");
                for model in models {
                    out.push_str("- ");
                    out.push_str(&model);
                    out.push('\n');
                }
                out
            }
        },
        "help" => "Commands: /new (fresh conversation), /model [name] (show or set the model), \
                   /models (list models), /help (this text)."
            .to_string(),
        other => format!("Unknown command: /{other}. Try /help."),
    };

    run.set_accumulated(&reply);
    sink.chat_delta(&reply, true).await;
    finish_run(
        state,
        run,
        RunState::Completed,
        None,
        Some((vec![ContentPart::text(reply.clone())], reply)),
    )
    .await;
}

/// Mark a run terminal and emit its closing events. Exactly one terminal
/// transition happens per run; later callers are no-ops. Once terminal, no
/// further child events carry this run id.
pub async fn finish_run(
    state: &Arc<GatewayState>,
    run: &Arc<Run>,
    terminal: RunState,
    error_message: Option<String>,
    completed: Option<(Vec<ContentPart>, String)>,
) {
    debug_assert!(terminal.is_terminal());
    if !run.try_finish(terminal) {
        return;
    }

    match terminal {
        RunState::Completed => {
            let (content, text) = completed.unwrap_or_else(|| {
                let text = run.accumulated_text();
                (vec![ContentPart::text(text.clone())], text)
            });
            run.set_accumulated(&text);

            let entry = HistoryEntry {
                role: sluice_sessions::Role::Assistant,
                content,
                timestamp: unix_now_ms(),
                stop_reason: Some("end_turn".into()),
                model: state.active_model().await,
                provider: None,
            };
            emit_chat_event(
                state,
                run,
                "final",
                json!({"message": &entry}),
            )
            .await;
            emit_agent_event(state, run, streams::LIFECYCLE, json!({"phase": "end"})).await;
            state.sessions.append(&run.session_key, entry).await;
        },
        RunState::Error => {
            let message = error_message.unwrap_or_else(|| "run failed".into());
            emit_agent_event(
                state,
                run,
                streams::LIFECYCLE,
                json!({"phase": "error", "error": message}),
            )
            .await;
            emit_chat_event(
                state,
                run,
                "error",
                json!({"errorMessage": message}),
            )
            .await;
        },
        RunState::Aborted => {
            // No synthesized final message: the adapter's last chat.delta is
            // the final visible state.
        },
        RunState::Running => unreachable!("finish_run requires a terminal state"),
    }

    info!(run_id = %run.run_id, state = terminal.as_str(), "run finished");
    state
        .logs
        .push(format!("run {} finished: {}", run.run_id, terminal.as_str()));
    run.resolve_waiters(&WaitOutcome {
        run_id: run.run_id.clone(),
        state: terminal,
        text: run.accumulated_text(),
    });
}

/// Find and cancel the target run for `chat.abort`.
pub async fn abort_run(
    state: &Arc<GatewayState>,
    run_id: Option<&str>,
    session_key: Option<&str>,
) -> Result<String, String> {
    let run = match run_id {
        Some(id) => state.runs.get(id).await.ok_or(format!("unknown run: {id}"))?,
        None => {
            let key = session_key.ok_or("sessionKey or runId required")?;
            state
                .runs
                .latest_running(key)
                .await
                .ok_or(format!("no running run in session: {key}"))?
        },
    };
    if run.state().is_terminal() {
        return Err(format!("run is not running: {}", run.run_id));
    }
    run.cancel.cancel();
    Ok(run.run_id.clone())
}

/// `agent.wait`: immediate for terminal runs, otherwise a waiter with its
/// own timeout. The timeout never cancels the run it watches.
pub async fn wait_for_run(
    state: &Arc<GatewayState>,
    run_id: &str,
    timeout: Duration,
) -> Result<Option<WaitOutcome>, String> {
    let run = state
        .runs
        .get(run_id)
        .await
        .ok_or(format!("unknown run: {run_id}"))?;

    if run.state().is_terminal() {
        return Ok(Some(WaitOutcome {
            run_id: run.run_id.clone(),
            state: run.state(),
            text: run.accumulated_text(),
        }));
    }

    let (tx, rx) = oneshot::channel();
    run.add_waiter(tx);
    // Re-check: the run may have finished between the state probe and the
    // waiter registration; resolve_waiters drains late registrations too,
    // but a terminal transition that already drained would leave us hanging.
    if run.state().is_terminal() {
        return Ok(Some(WaitOutcome {
            run_id: run.run_id.clone(),
            state: run.state(),
            text: run.accumulated_text(),
        }));
    }

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(outcome)) => Ok(Some(outcome)),
        Ok(Err(_)) => Ok(Some(WaitOutcome {
            run_id: run.run_id.clone(),
            state: run.state(),
            text: run.accumulated_text(),
        })),
        Err(_) => Ok(None), // timeout: caller maps to AGENT_TIMEOUT
    }
}

/// Run to completion inline (HTTP surface): no idempotency key, the caller
/// needs the terminal text.
pub async fn chat_and_wait(
    state: &Arc<GatewayState>,
    session_key: &str,
    message: &str,
) -> WaitOutcome {
    let run = create_run(state, session_key, message).await;
    execute_run(Arc::clone(state), Arc::clone(&run)).await;
    WaitOutcome {
        run_id: run.run_id.clone(),
        state: run.state(),
        text: run.accumulated_text(),
    }
}
