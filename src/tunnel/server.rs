//! Tunnel endpoint: `GET /api/tunnel?id=<correlation id>`.
//!
//! A request for an unknown id opens a new session: it is admitted through
//! the [`ConnectionsManager`](super::ConnectionsManager), a subprocess is
//! spawned and its stdout/stdin are bridged to the upgraded socket. A request
//! for a known id is a reconnect and becomes a handover of that session's
//! transport.
//!
//! Every check that can still produce a status code runs before the upgrade
//! response is returned:
//!
//! | Condition                          | Response |
//! |------------------------------------|----------|
//! | missing / malformed `id`           | 400      |
//! | known id, tunnel already ended     | 500      |
//! | known id                           | 101, handover |
//! | unknown id, at `max_clients`       | 503      |
//! | unknown id                         | 101, new session |

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ws::WebSocket, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::connection::{ProxyConnection, TunnelError};
use super::is_valid_id;
use super::manager::ConnectionsManager;
use crate::process::terminate_group;
use crate::routes;
use crate::state::AppState;
use crate::transport::{CloseReason, Frame, Transport};
use crate::util::run_both;

/// Path of the upgrade endpoint.
pub const TUNNEL_PATH: &str = "/api/tunnel";

/// How long an ended session waits for its process before escalating.
const PROCESS_GRACE: Duration = Duration::from_secs(2);

/// How long an exited process's remaining stdout may take to reach the
/// transport before the tunnel is closed anyway.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Full server router: health probe plus the tunnel endpoint.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(routes::health::health))
        .route(TUNNEL_PATH, get(tunnel_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Query params for the tunnel upgrade.
#[derive(Deserialize)]
pub struct TunnelQuery {
    id: Option<String>,
}

/// Removes a session from the manager however the session ends, including
/// an upgrade that never completes.
struct SessionGuard {
    connections: ConnectionsManager,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.connections.remove(&self.id);
    }
}

pub async fn tunnel_upgrade(
    State(state): State<AppState>,
    Query(query): Query<TunnelQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(id) = query.id.filter(|id| is_valid_id(id)) else {
        return (StatusCode::BAD_REQUEST, "Missing or invalid id").into_response();
    };

    if let Some(conn) = state.connections.get(&id) {
        if conn.is_terminated() {
            warn!(
                id = %id,
                state = conn.state().as_str(),
                "handover refused: tunnel already terminated"
            );
            return (StatusCode::INTERNAL_SERVER_ERROR, "Tunnel already terminated")
                .into_response();
        }
        let span = info_span!("tunnel", id = %id);
        return ws.on_upgrade(move |socket| {
            handover(state, conn, Transport::from_axum(socket)).instrument(span)
        });
    }

    let conn = Arc::new(ProxyConnection::server(id.clone(), state.timeouts));
    if !state.connections.try_add(&id, conn.clone()) {
        state.stats.rejected.fetch_add(1, Ordering::Relaxed);
        return (StatusCode::SERVICE_UNAVAILABLE, "Tunnel capacity reached").into_response();
    }
    let guard = SessionGuard {
        connections: state.connections.clone(),
        id: id.clone(),
    };

    let span = info_span!("tunnel", id = %id);
    let failed_id = id.clone();
    ws.on_failed_upgrade(move |e| warn!(id = %failed_id, "tunnel upgrade failed: {e}"))
        .on_upgrade(move |socket| {
            async move {
                run_session(&state, &conn, socket).await;
                drop(guard);
            }
            .instrument(span)
        })
}

async fn handover(state: AppState, conn: Arc<ProxyConnection>, transport: Transport) {
    if conn.accept_handover(transport).await.is_ok() {
        state.stats.handovers.fetch_add(1, Ordering::Relaxed);
    }
}

/// Bridge one freshly upgraded socket to a new subprocess until either ends.
async fn run_session(state: &AppState, conn: &ProxyConnection, socket: WebSocket) {
    conn.accept(Transport::from_axum(socket));

    let mut child = match state.process_factory.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!("failed to spawn tunnel process: {e}");
            let reason = CloseReason::internal_error("process spawn failed");
            if let Err(e) = conn.send_message(Frame::Close(Some(reason))).await {
                warn!("close after spawn failure: {e}");
            }
            return;
        }
    };
    state.stats.sessions_started.fetch_add(1, Ordering::Relaxed);
    let pid = child.id();
    info!(pid, "tunnel process spawned");

    let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
        error!("tunnel process has no piped stdio");
        let _ = conn.close().await;
        return;
    };

    let token = CancellationToken::new();
    let watcher = async {
        watch_process(conn, &mut child, pid, &token).await;
        Ok::<(), TunnelError>(())
    };
    let bridge = async {
        let result = conn.start(stdout, stdin).await;
        token.cancel();
        result
    };

    match run_both(&token, watcher, bridge).await {
        Ok(()) => info!("tunnel session ended"),
        Err(e) => warn!("tunnel session failed: {e}"),
    }
}

/// Close the tunnel when the process exits, once its stdout is drained; stop
/// the process when the bridge ends first.
async fn watch_process(
    conn: &ProxyConnection,
    child: &mut Child,
    pid: Option<u32>,
    token: &CancellationToken,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        () = token.cancelled() => None,
    };
    match exited {
        Some(status) => {
            match status {
                Ok(status) => info!(%status, "tunnel process exited"),
                Err(e) => warn!("waiting for tunnel process: {e}"),
            }
            if tokio::time::timeout(OUTPUT_DRAIN_GRACE, conn.source_drained())
                .await
                .is_err()
            {
                warn!("process output not drained after exit, closing anyway");
            }
            if let Err(e) = conn.close().await {
                debug!("close after process exit: {e}");
            }
        }
        None => stop_process(child, pid).await,
    }
}

async fn stop_process(child: &mut Child, pid: Option<u32>) {
    if let Ok(status) = tokio::time::timeout(PROCESS_GRACE, child.wait()).await {
        if let Ok(status) = status {
            info!(%status, "tunnel process exited");
        }
        return;
    }
    if let Some(pid) = pid {
        if let Err(e) = terminate_group(pid) {
            warn!(pid, "SIGTERM to process group failed: {e}");
        }
    }
    if tokio::time::timeout(PROCESS_GRACE, child.wait()).await.is_ok() {
        info!(?pid, "tunnel process terminated");
        return;
    }
    warn!(?pid, "tunnel process ignored SIGTERM, killing");
    let _ = child.start_kill();
    let _ = child.wait().await;
}
