//! Tunnel client configuration.

use std::time::Duration;

use webtunnel_core::{Config, ServerAddr};

/// Time the relay has to acknowledge the control handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(1000);
/// Interval between `ping` writes on an active control channel.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5000);
/// Delay before a pool slot that failed before selection is reopened.
pub const POOL_RETRY_DELAY: Duration = Duration::from_millis(1000);
/// Read buffer for relay and local sockets.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Configuration for the client's connections to the relay.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Local service exposed through the tunnel.
    pub local_server: ServerAddr,

    /// Relay server address.
    pub remote_server: ServerAddr,

    /// Number of idle data connections kept open.
    pub pool_size: usize,

    /// `Host` header replacement, if any.
    pub rewrite_host: Option<String>,

    /// Log selection payload previews.
    pub debug: bool,

    /// Handshake acknowledgement deadline.
    pub handshake_timeout: Duration,

    /// Heartbeat interval.
    pub heartbeat_interval: Duration,

    /// Reconnection policy after the control channel drops.
    pub reconnect: ReconnectPolicy,

    /// Delay before reopening a pool slot whose connection failed.
    pub pool_retry_delay: Duration,

    /// Size of socket read buffers.
    pub read_buffer_size: usize,
}

/// Reconnection policy.
///
/// The default retries forever without waiting, which keeps a dropped tunnel
/// down for as short a time as possible.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Initial delay before first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failed attempt.
    pub multiplier: f64,
    /// Maximum number of reconnect attempts (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Fixed delay between attempts, unlimited attempts.
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            max_attempts: None,
        }
    }

    /// Delay before attempt `attempt` (0-indexed), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        // Overflow and 0 * inf both land on the cap.
        Duration::try_from_secs_f64(secs).map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Whether another attempt should be made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}

impl TunnelConfig {
    /// Create a tunnel config from resolved settings, with default timings.
    pub fn new(settings: &Config) -> Self {
        Self {
            local_server: settings.local_server.clone(),
            remote_server: settings.remote_server.clone(),
            pool_size: settings.pool_size,
            rewrite_host: settings.rewrite_host.clone(),
            debug: settings.debug,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            reconnect: ReconnectPolicy::default(),
            pool_retry_delay: POOL_RETRY_DELAY,
            read_buffer_size: READ_BUFFER_SIZE,
        }
    }
}
