use std::{path::PathBuf, sync::Arc};

use {anyhow::Result, clap::Parser};

use {
    sluice_agents::{AgentHandler, DemoAdapter, ollama::OllamaAdapter, openai::OpenAiCompatAdapter},
    sluice_gateway::{GatewayConfig, start_gateway},
};

/// WebSocket gateway that multiplexes AI chat clients onto an LLM backend.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Address to bind to.
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 18789)]
    port: u16,

    /// Backend: "demo", "ollama", or "openai".
    #[arg(long, default_value = "demo")]
    backend: String,

    /// Backend base URL (ollama/openai backends).
    #[arg(long)]
    backend_url: Option<String>,

    /// Default model name.
    #[arg(long)]
    model: Option<String>,

    /// Backend API key (openai backend).
    #[arg(long, env = "SLUICE_BACKEND_KEY")]
    backend_key: Option<String>,

    /// Shared connect token. Also settable via SLUICE_TOKEN.
    #[arg(long, env = "SLUICE_TOKEN")]
    token: Option<String>,

    /// Shared connect password. Also settable via SLUICE_PASSWORD.
    #[arg(long, env = "SLUICE_PASSWORD")]
    password: Option<String>,

    /// Directory for per-session JSONL logs.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let handler: Option<Arc<dyn AgentHandler>> = match args.backend.as_str() {
        "demo" => Some(Arc::new(DemoAdapter)),
        "ollama" => Some(Arc::new(OllamaAdapter::new(args.backend_url, args.model))),
        "openai" => {
            let url = args
                .backend_url
                .ok_or_else(|| anyhow::anyhow!("--backend-url is required for openai"))?;
            let model = args
                .model
                .ok_or_else(|| anyhow::anyhow!("--model is required for openai"))?;
            let mut adapter = OpenAiCompatAdapter::new(url, model);
            if let Some(key) = args.backend_key {
                adapter = adapter.with_api_key(key);
            }
            Some(Arc::new(adapter))
        },
        other => anyhow::bail!("unknown backend: {other}"),
    };

    let config = GatewayConfig {
        port: args.port,
        hostname: args.bind,
        auth_token: args.token,
        auth_password: args.password,
        log_dir: args.log_dir,
        ..Default::default()
    };

    start_gateway(config, handler).await
}
