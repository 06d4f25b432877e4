//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::process::ProcessFactory;
use crate::tunnel::{ConnectionsManager, HandoverTimeouts, IdleSignal};

/// Shared application state for the tunnel server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Live tunnels keyed by correlation id.
    pub connections: ConnectionsManager,
    /// Spawns the subprocess bridged by each new tunnel.
    pub process_factory: Arc<dyn ProcessFactory>,
    pub timeouts: HandoverTimeouts,
    pub stats: Arc<ProxyStats>,
}

impl AppState {
    /// Build the state and the manager's idle signal. Must run inside a
    /// tokio runtime (the idle timer starts immediately).
    pub fn new(config: Config, process_factory: Arc<dyn ProcessFactory>) -> (Self, IdleSignal) {
        let shutdown_delay = match config.server.idle_shutdown_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let (connections, idle) = ConnectionsManager::new(config.server.max_clients, shutdown_delay);
        let state = Self {
            timeouts: HandoverTimeouts::from(&config.handover),
            config: Arc::new(config),
            start_time: Instant::now(),
            connections,
            process_factory,
            stats: Arc::new(ProxyStats::default()),
        };
        (state, idle)
    }
}

/// Lifetime counters, updated lock-free from the tunnel handlers.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// New tunnels whose process was spawned.
    pub sessions_started: AtomicU64,
    /// Completed server-side handovers.
    pub handovers: AtomicU64,
    /// New tunnels refused at capacity.
    pub rejected: AtomicU64,
}
