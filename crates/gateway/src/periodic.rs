//! Interval tasks: tick, health refresh, and the dedupe sweep.
//!
//! A panic in one iteration is caught, logged, and the loop continues; a
//! periodic task must never take the process down.

use std::{sync::Arc, time::Duration};

use {futures_util::FutureExt, tracing::error};

use crate::{
    broadcast::{broadcast_health, broadcast_tick},
    state::GatewayState,
};

/// Spawn all interval tasks and park their handles on the state so shutdown
/// can stop them.
pub async fn spawn_periodic_tasks(state: &Arc<GatewayState>) {
    let mut tasks = state.tasks.lock().await;

    let tick_state = Arc::clone(state);
    tasks.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(
            tick_state.config.tick_interval_ms,
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            guard("tick", broadcast_tick(&tick_state)).await;
        }
    }));

    let health_state = Arc::clone(state);
    tasks.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(
            health_state.config.health_refresh_interval_ms,
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the first health
        // broadcast lands one interval in.
        interval.tick().await;
        loop {
            interval.tick().await;
            guard("health", broadcast_health(&health_state)).await;
        }
    }));

    let sweep_state = Arc::clone(state);
    tasks.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(
            sweep_state.config.dedupe_ttl_ms.max(1_000),
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            interval.tick().await;
            sweep_state.inner.write().await.dedupe.sweep();
        }
    }));
}

async fn guard(name: &str, fut: impl std::future::Future<Output = ()>) {
    if std::panic::AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .is_err()
    {
        error!("periodic task '{name}' panicked; continuing");
    }
}
