//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `WSBRIDGE_LISTEN`, `WSBRIDGE_MAX_CLIENTS`,
//!    `WSBRIDGE_URL`, `WSBRIDGE_TOKEN`
//! 2. **Config file**: path via `--config <path>`, or `wsbridge.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:7777"
//! max_clients = 10
//! idle_shutdown_secs = 3600     # 0 = never shut down
//!
//! [process]
//! command = "/usr/sbin/sshd"
//! args = ["-i", "-f", "/etc/ssh/sshd_config"]
//! working_dir = "~"
//!
//! [process.env]
//! LANG = "C.UTF-8"
//!
//! [handover]
//! initiate_timeout_ms = 30000
//! accept_timeout_ms = 25000
//! peer_closed_timeout_ms = 15000
//!
//! # Client (`wsbridge proxy`) only
//! [client]
//! url = "wss://node.example.com/api/tunnel"
//! handover_interval_secs = 1800  # 0 = never hand over
//! token = "bearer-token"
//!
//! [logging]
//! level = "info"
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub handover: HandoverConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Tunnel endpoint and admission settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:7777`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent tunnels (default 10).
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Seconds with no tunnel before the server exits (default 3600, 0 = never).
    #[serde(default = "default_idle_shutdown_secs")]
    pub idle_shutdown_secs: u64,
}

/// The subprocess spawned for every new tunnel.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    /// Program to run (default `/bin/sh`).
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory, `~` expanded (default `~`).
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    /// Merged into the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Bounds for every wait in the handover handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct HandoverConfig {
    /// Whole client-side handover (default 30 000).
    #[serde(default = "default_initiate_timeout_ms")]
    pub initiate_timeout_ms: u64,
    /// Whole server-side handover (default 25 000).
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,
    /// Wait for the old transport's close to be acknowledged (default 15 000).
    #[serde(default = "default_peer_closed_timeout_ms")]
    pub peer_closed_timeout_ms: u64,
}

/// Client driver settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Tunnel endpoint, e.g. `wss://node.example.com/api/tunnel`.
    pub url: Option<String>,
    /// Seconds between transport handovers (default 1800, 0 = never).
    #[serde(default = "default_handover_interval_secs")]
    pub handover_interval_secs: u64,
    /// Bearer token sent on every upgrade request. Override with `WSBRIDGE_TOKEN`.
    pub token: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "127.0.0.1:7777".to_string()
}
fn default_max_clients() -> usize {
    10
}
fn default_idle_shutdown_secs() -> u64 {
    3600
}
fn default_command() -> String {
    "/bin/sh".to_string()
}
fn default_working_dir() -> String {
    "~".to_string()
}
fn default_initiate_timeout_ms() -> u64 {
    30_000
}
fn default_accept_timeout_ms() -> u64 {
    25_000
}
fn default_peer_closed_timeout_ms() -> u64 {
    15_000
}
fn default_handover_interval_secs() -> u64 {
    1800
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_clients: default_max_clients(),
            idle_shutdown_secs: default_idle_shutdown_secs(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            working_dir: default_working_dir(),
            env: HashMap::new(),
        }
    }
}

impl Default for HandoverConfig {
    fn default() -> Self {
        Self {
            initiate_timeout_ms: default_initiate_timeout_ms(),
            accept_timeout_ms: default_accept_timeout_ms(),
            peer_closed_timeout_ms: default_peer_closed_timeout_ms(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: None,
            handover_interval_secs: default_handover_interval_secs(),
            token: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `wsbridge.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            Self::parse(&content).unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("wsbridge.toml").exists() {
            let content =
                std::fs::read_to_string("wsbridge.toml").expect("Failed to read wsbridge.toml");
            Self::parse(&content).expect("Failed to parse wsbridge.toml")
        } else {
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Parse a TOML document.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = var("WSBRIDGE_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(max) = var("WSBRIDGE_MAX_CLIENTS").and_then(|v| v.parse().ok()) {
            self.server.max_clients = max;
        }
        if let Some(url) = var("WSBRIDGE_URL") {
            self.client.url = Some(url);
        }
        if let Some(token) = var("WSBRIDGE_TOKEN") {
            self.client.token = Some(token);
        }
    }
}
