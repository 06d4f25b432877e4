#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # wsbridge
//!
//! Tunnels an interactive byte stream (typically `sshd -i` on a compute node)
//! over a WebSocket, and swaps the WebSocket for a fresh one mid-session
//! without the stream noticing.
//!
//! ## Subcommands
//!
//! - `wsbridge serve`: run the tunnel endpoint; each new tunnel gets its own
//!   subprocess. Exits on SIGINT/SIGTERM or after `idle_shutdown_secs` with no
//!   tunnel.
//! - `wsbridge proxy`: bridge stdin/stdout to a tunnel endpoint, handing the
//!   transport over every `handover_interval_secs`. Suitable as an SSH
//!   `ProxyCommand`.
//!
//! ## API surface
//!
//! | Method | Path              | Description                               |
//! |--------|-------------------|-------------------------------------------|
//! | GET    | `/api/health`     | Liveness probe and counters               |
//! | GET    | `/api/tunnel?id=` | WebSocket upgrade: new tunnel or handover |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, clap subcommands, graceful shutdown
//! config.rs        TOML + env-var configuration
//! transport.rs     Frame, Transport (axum / tungstenite), WsTransportFactory
//! process.rs       ProcessFactory, CommandFactory (piped subprocess)
//! state.rs         AppState, ProxyStats
//! util.rs          run_both supervisor, expand_tilde
//! routes/
//!   health.rs      GET /api/health
//! tunnel/
//!   connection.rs  ProxyConnection (I/O loops, handover state machine)
//!   manager.rs     ConnectionsManager (admission, idle timer)
//!   server.rs      /api/tunnel handler, session provisioning
//!   client.rs      run_client_proxy driver, handover ticker
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

use wsbridge::tunnel::client::{interval_ticks, run_client_proxy};
use wsbridge::tunnel::{is_valid_id, server, HandoverTimeouts, IdleSignal};
use wsbridge::{AppState, CommandFactory, Config, WsTransportFactory};

/// Handover-capable WebSocket tunnel for interactive sessions.
#[derive(Parser)]
#[command(name = "wsbridge", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel endpoint.
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Bridge stdin/stdout to a tunnel endpoint.
    Proxy {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Tunnel endpoint, e.g. `wss://node.example.com/api/tunnel`.
        #[arg(long)]
        url: Option<String>,
        /// Correlation id (default: a fresh UUID).
        #[arg(long)]
        id: Option<String>,
        /// Seconds between transport handovers (0 = never).
        #[arg(long)]
        handover_interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => run_server(config.as_deref()).await,
        Commands::Proxy {
            config,
            url,
            id,
            handover_interval,
        } => {
            let code = run_proxy(config.as_deref(), url, id, handover_interval).await;
            // The runtime would otherwise wait on the blocking stdin reader.
            std::process::exit(code);
        }
    }
}

fn init_tracing(config: &Config, to_stderr: bool) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    let builder = tracing_subscriber::fmt().with_env_filter(log_filter);
    if to_stderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config, false);

    info!("wsbridge v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!(
        command = %config.process.command,
        max_clients = config.server.max_clients,
        "Tunnel process configured"
    );

    let factory = Arc::new(CommandFactory::from_config(&config.process));
    let (state, idle) = AppState::new(config, factory);
    let app = server::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(idle, state.config.server.idle_shutdown_secs))
        .await
        .expect("Server error");

    info!("Shutting down...");
    state.connections.close_all().await;
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while !state.connections.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        info!(
            remaining = state.connections.len(),
            "Tunnels still open at exit"
        );
    }
    info!("Goodbye");
}

async fn shutdown_signal(mut idle: IdleSignal, idle_secs: u64) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
            () = idle.fired() => info!("No tunnel for {idle_secs}s, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            () = idle.fired() => info!("No tunnel for {idle_secs}s, shutting down"),
        }
    }
}

async fn run_proxy(
    config_path: Option<&str>,
    url: Option<String>,
    id: Option<String>,
    handover_interval: Option<u64>,
) -> i32 {
    let config = Config::load(config_path);
    // stdout carries tunnel bytes.
    init_tracing(&config, true);

    let Some(url) = url.or_else(|| config.client.url.clone()) else {
        error!("No tunnel URL: pass --url, set WSBRIDGE_URL or [client] url");
        return 2;
    };
    let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
    if !is_valid_id(&id) {
        error!("Invalid tunnel id: {id}");
        return 2;
    }
    let interval = handover_interval.unwrap_or(config.client.handover_interval_secs);

    info!(id = %id, url = %url, handover_interval_secs = interval, "Opening tunnel");
    let factory = Arc::new(WsTransportFactory::new(url, config.client.token.clone()));
    let tunnel = run_client_proxy(
        &id,
        factory,
        HandoverTimeouts::from(&config.handover),
        tokio::io::stdin(),
        tokio::io::stdout(),
        interval_ticks(Duration::from_secs(interval)),
    );

    tokio::select! {
        result = tunnel => match result {
            Ok(()) => 0,
            Err(e) => {
                error!(id = %id, "Tunnel failed: {e}");
                1
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT");
            130
        }
    }
}
