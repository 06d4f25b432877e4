//! HTTP route handlers other than the tunnel endpoint itself.

pub mod health;
