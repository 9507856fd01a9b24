//! The sluice gateway: multiplexes JSON-over-WebSocket chat clients onto a
//! pluggable LLM backend, with an OpenAI-shaped HTTP compatibility surface.

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod http;
pub mod logs;
pub mod methods;
pub mod periodic;
pub mod runs;
pub mod server;
pub mod state;
pub mod ws;

#[cfg(test)]
pub(crate) mod test_util;

pub use {
    config::GatewayConfig,
    server::{build_gateway_app, start_gateway},
    state::GatewayState,
};
