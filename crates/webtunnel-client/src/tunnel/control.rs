//! Control channel: identity handshake and heartbeat over the single
//! long-lived relay connection.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webtunnel_core::protocol::{self, Handshake, PING, PONG};
use webtunnel_core::{Identity, ServerAddr};

use super::connector::Connector;
use super::error::TunnelError;

/// Lifecycle of the control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Disconnected,
    Connecting,
    AwaitingAck,
    Active,
    Closing,
}

/// An authenticated control connection.
pub struct ControlChannel<S> {
    stream: S,
    read_buffer_size: usize,
}

impl<S> std::fmt::Debug for ControlChannel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel").finish_non_exhaustive()
    }
}

impl<S> ControlChannel<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    /// Connect to the relay and perform the identity handshake.
    ///
    /// The relay must answer `{"ok":true}` within `handshake_timeout` of the
    /// transport connecting. State transitions are published on `state`;
    /// on failure the transport is dropped and the state is left at
    /// [`ControlState::AwaitingAck`] or [`ControlState::Connecting`] for the
    /// caller to reset.
    pub async fn open<C>(
        connector: &C,
        addr: &ServerAddr,
        identity: &Identity,
        handshake_timeout: Duration,
        state: &watch::Sender<ControlState>,
    ) -> Result<Self, TunnelError>
    where
        C: Connector<Stream = S>,
    {
        state.send_replace(ControlState::Connecting);
        let mut stream = connector.connect(addr).await?;
        debug!(remote = %addr, "Connected to relay");

        state.send_replace(ControlState::AwaitingAck);
        let handshake = Handshake::new(identity)
            .to_bytes()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut buf = vec![0u8; 1024];
        let ack = timeout(handshake_timeout, async {
            stream.write_all(&handshake).await?;
            stream.read(&mut buf).await
        })
        .await;

        let n = match ack {
            Err(_) => {
                warn!(remote = %addr, "Server does not respond");
                return Err(TunnelError::HandshakeTimeout);
            }
            Ok(Err(e)) => return Err(TunnelError::Transport(e)),
            Ok(Ok(0)) => {
                return Err(TunnelError::ConnectionRejected(
                    "connection closed before acknowledgement".into(),
                ));
            }
            Ok(Ok(n)) => n,
        };

        match protocol::parse_ack(&buf[..n]) {
            Some(true) => {}
            Some(false) => {
                return Err(TunnelError::ConnectionRejected("relay refused identity".into()));
            }
            None => {
                return Err(TunnelError::ConnectionRejected(
                    "malformed acknowledgement".into(),
                ));
            }
        }

        state.send_replace(ControlState::Active);
        info!(remote = %addr, "Control channel active");
        Ok(Self {
            stream,
            read_buffer_size: buf.len(),
        })
    }

    /// Drive the heartbeat until the transport fails or `cancel` fires.
    ///
    /// Writes `ping` every `heartbeat_interval`, the first one a full interval
    /// after activation. Replies are only logged. Returns `Ok(())` after a
    /// cancellation has shut the socket down, and `Err` on any transport
    /// error, including the relay closing the connection.
    pub async fn run(
        self,
        heartbeat_interval: Duration,
        cancel: &CancellationToken,
    ) -> io::Result<()> {
        let (mut reader, mut writer) = tokio::io::split(self.stream);
        let mut buf = vec![0u8; self.read_buffer_size];
        let mut heartbeat = interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Closing control connection");
                    // The peer may already be gone; the socket is dropped either way.
                    let _ = writer.shutdown().await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    if awaiting_pong {
                        warn!("No ping response since last heartbeat");
                    }
                    debug!("Sending ping request to server");
                    writer.write_all(PING).await?;
                    awaiting_pong = true;
                }
                read = reader.read(&mut buf) => {
                    match read? {
                        0 => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "control connection closed by relay",
                            ));
                        }
                        n if &buf[..n] == PONG => {
                            debug!("Ping response received");
                            awaiting_pong = false;
                        }
                        n => {
                            warn!(bytes = n, "Unexpected control payload");
                        }
                    }
                }
            }
        }
    }
}
