//! Unauthenticated health-check endpoint.

use std::sync::atomic::Ordering;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health`: liveness probe.
///
/// Returns status, uptime, version, tunnel occupancy and lifetime counters.
/// No authentication required, suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let stats = &state.stats;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "active_connections": state.connections.len(),
        "max_clients": state.connections.max_clients(),
        "sessions_started": stats.sessions_started.load(Ordering::Relaxed),
        "handovers": stats.handovers.load(Ordering::Relaxed),
        "rejected": stats.rejected.load(Ordering::Relaxed),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::Config;
    use crate::process::CommandFactory;
    use crate::tunnel::{HandoverTimeouts, ProxyConnection};

    #[tokio::test]
    async fn test_health_reports_counters() {
        let mut config = Config::default();
        config.server.max_clients = 3;
        config.server.idle_shutdown_secs = 0;
        let (state, _idle) = AppState::new(config, Arc::new(CommandFactory::new("cat", Vec::new())));
        state.stats.rejected.fetch_add(2, Ordering::Relaxed);
        assert!(state.connections.try_add(
            "a",
            Arc::new(ProxyConnection::server("a", HandoverTimeouts::default()))
        ));

        let Json(body) = health(State(state)).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["active_connections"], 1);
        assert_eq!(body["max_clients"], 3);
        assert_eq!(body["sessions_started"], 0);
        assert_eq!(body["rejected"], 2);
    }
}
