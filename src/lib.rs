#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! wsbridge library: an SSH-capable byte-stream tunnel over WebSocket whose
//! transport can be handed over mid-session.
//!
//! - `transport`: WebSocket adapters, `Frame`, `TransportFactory`
//! - `tunnel`: `ProxyConnection`, `ConnectionsManager`, server endpoint,
//!   client driver
//! - `process`: subprocess spawning for server-side tunnels
//! - `config`: configuration loading
//! - `routes`: health endpoint
//! - `state`: shared handler state and counters

pub mod config;
pub mod process;
pub mod routes;
pub mod state;
pub mod transport;
pub mod tunnel;
pub mod util;

#[cfg(test)]
mod testing;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use process::{CommandFactory, ProcessFactory};
pub use state::AppState;
pub use transport::{Transport, TransportError, TransportFactory, WsTransportFactory};
pub use tunnel::{ConnectionsManager, ProxyConnection, TunnelError};
