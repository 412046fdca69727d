//! Tunnel client for exposing a local service through a relay server.
//!
//! Provides the control channel with heartbeat keepalive and automatic
//! reconnection, the data connection pool, and per-request bridging.

pub mod bridge;
pub mod client;
pub mod config;
pub mod connector;
pub mod control;
pub mod error;
pub mod pool;
pub mod rewrite;

#[cfg(test)]
pub(crate) mod testing;

pub use client::Client;
pub use config::{ReconnectPolicy, TunnelConfig};
pub use connector::{Connector, TcpConnector};
pub use control::{ControlChannel, ControlState};
pub use error::TunnelError;
pub use pool::ConnectionPool;
pub use rewrite::rewrite_host;
