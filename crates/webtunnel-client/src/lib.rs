//! webtunnel Client Library
//!
//! Exposes a local TCP/HTTP service through an outbound relay connection:
//! - Authenticated control channel with heartbeat and reconnection
//! - Self-healing pool of pre-opened data connections
//! - Byte splicing between relay and local service
//! - Optional `Host` header rewriting

pub mod tunnel;
