use std::{
    net::SocketAddr,
    sync::{Arc, atomic::Ordering},
};

use {
    axum::{Router, routing::post},
    tower_http::cors::{Any, CorsLayer},
    tracing::info,
};

use sluice_agents::AgentHandler;
use sluice_protocol::{PROTOCOL_VERSION, close_codes};

use crate::{
    auth::resolve_auth,
    broadcast::{BroadcastOpts, broadcast},
    config::GatewayConfig,
    http,
    methods::MethodRegistry,
    periodic::spawn_periodic_tasks,
    state::{GatewayState, Outbound},
};

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub state: Arc<GatewayState>,
    pub methods: Arc<MethodRegistry>,
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>, methods: Arc<MethodRegistry>) -> Router {
    let app_state = AppState { state, methods };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/chat/completions", post(http::chat_completions))
        .route("/v1/responses", post(http::todo_stub))
        .route("/hooks/wake", post(http::todo_stub))
        .route("/hooks/agent", post(http::todo_stub))
        .route("/tools/invoke", post(http::todo_stub))
        .fallback(http::fallback)
        .layer(cors)
        .with_state(app_state)
}

/// Start the gateway and block until a shutdown signal drains it.
pub async fn start_gateway(
    config: GatewayConfig,
    handler: Option<Arc<dyn AgentHandler>>,
) -> anyhow::Result<()> {
    let auth = resolve_auth(config.auth_token.clone(), config.auth_password.clone());
    let bind = format!("{}:{}", config.hostname, config.port);
    let state = GatewayState::new(config, auth, handler);
    let methods = Arc::new(MethodRegistry::new());

    spawn_periodic_tasks(&state).await;

    let app = build_gateway_app(Arc::clone(&state), Arc::clone(&methods));
    let addr: SocketAddr = bind.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Startup banner.
    let lines = [
        format!("sluice gateway v{}", state.version),
        format!("protocol v{PROTOCOL_VERSION}, listening on {addr}"),
        format!("{} methods registered", methods.method_names().len()),
        format!("auth: {}", state.auth.mode.as_str()),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    let drain_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            drain(&drain_state).await;
        })
        .await?;
    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            },
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining");
}

/// Graceful drain: tell every client, stop the timers, cancel live runs,
/// close the sockets.
pub async fn drain(state: &Arc<GatewayState>) {
    state.shutting_down.store(true, Ordering::Release);

    broadcast(
        state,
        "shutdown",
        serde_json::json!({"reason": "server_stop"}),
        BroadcastOpts::default(),
    )
    .await;

    for task in state.tasks.lock().await.drain(..) {
        task.abort();
    }

    state.runs.cancel_all().await;

    let inner = state.inner.read().await;
    for client in inner.clients.values() {
        let _ = client.sender.try_send(Outbound::Close(
            close_codes::RESTART,
            "server restart".into(),
        ));
    }
}
