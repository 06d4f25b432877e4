//! Handover-capable byte-stream tunnels over WebSocket.
//!
//! - [`connection`]: `ProxyConnection`, the duplex pipe whose transport can
//!   be swapped mid-session.
//! - [`manager`]: registry of live tunnels, admission and idle shutdown.
//! - [`server`]: the `/api/tunnel` upgrade endpoint; one subprocess per tunnel.
//! - [`client`]: the driver that bridges local stdio and triggers handovers.

pub mod client;
pub mod connection;
pub mod manager;
pub mod server;

pub use connection::{ConnectionState, HandoverTimeouts, ProxyConnection, TunnelError};
pub use manager::{ConnectionsManager, IdleSignal};

/// Validate a correlation id: alphanumeric, dash, underscore, dot, 1-64 chars.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_id() {
        assert!(is_valid_id("0b6f7c1e-2a4d-4c57-9d1e-0f3a8c2b9e71"));
        assert!(is_valid_id("node_1.session"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("has space"));
        assert!(!is_valid_id("../etc"));
        assert!(!is_valid_id(&"x".repeat(65)));
    }
}
