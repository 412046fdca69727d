//! Tunnel client error types.

use webtunnel_core::ServerAddr;

/// Errors that can end a connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Could not connect to local server ({endpoint})")]
    LocalUnreachable {
        endpoint: ServerAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server does not respond")]
    HandshakeTimeout,

    #[error("Connection was closed by server: {0}")]
    ConnectionRejected(String),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Client was closed")]
    Closed,
}
