//! Request bridge: splices one selected relay connection with a fresh
//! connection to the local service.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use webtunnel_core::ServerAddr;

use super::config::TunnelConfig;
use super::connector::Connector;
use super::rewrite::rewrite_host;

/// Serves selected data connections.
pub struct RequestBridge<C> {
    connector: Arc<C>,
    local_server: ServerAddr,
    rewrite_host: Option<Arc<str>>,
    buffer_size: usize,
}

impl<C: Connector> RequestBridge<C> {
    pub fn new(connector: Arc<C>, config: &TunnelConfig) -> Self {
        Self {
            connector,
            local_server: config.local_server.clone(),
            rewrite_host: config.rewrite_host.as_deref().map(Arc::from),
            buffer_size: config.read_buffer_size,
        }
    }

    /// Forward `first_chunk` and everything after it from `remote` to a new
    /// local connection, and everything the local service answers back.
    ///
    /// Request bytes pass through the `Host` rewriter chunk by chunk;
    /// responses are copied untouched. The first side to close or fail ends
    /// the bridge and both sockets are dropped together. Cancelling `cancel`
    /// does the same.
    pub async fn run<R>(
        &self,
        remote: R,
        first_chunk: &[u8],
        cancel: &CancellationToken,
    ) -> io::Result<()>
    where
        R: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let local = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            local = self.connector.connect(&self.local_server) => local?,
        };
        debug!(local = %self.local_server, "New connection to local server established");

        let target = self.rewrite_host.as_deref();
        let (mut remote_rd, mut remote_wr) = tokio::io::split(remote);
        let (mut local_rd, mut local_wr) = tokio::io::split(local);

        let upstream = async {
            local_wr.write_all(&rewrite_host(first_chunk, target)).await?;
            let mut buf = vec![0u8; self.buffer_size];
            loop {
                let n = remote_rd.read(&mut buf).await?;
                if n == 0 {
                    return Ok::<_, io::Error>(());
                }
                local_wr.write_all(&rewrite_host(&buf[..n], target)).await?;
            }
        };
        let downstream = tokio::io::copy(&mut local_rd, &mut remote_wr);

        tokio::select! {
            () = cancel.cancelled() => {
                debug!("Close active connection");
                Ok(())
            }
            res = upstream => res,
            res = downstream => res.map(|_| ()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::tunnel::testing::{MemoryConnector, Peer};
    use webtunnel_core::Config;

    fn bridge_with(
        connector: &MemoryConnector,
        rewrite: Option<&str>,
    ) -> Arc<RequestBridge<MemoryConnector>> {
        let settings = Config {
            local_server: ServerAddr::new("local", 3001),
            rewrite_host: rewrite.map(str::to_owned),
            ..Default::default()
        };
        Arc::new(RequestBridge::new(
            Arc::new(connector.clone()),
            &TunnelConfig::new(&settings),
        ))
    }

    #[tokio::test]
    async fn forwards_both_directions_and_rewrites_requests() {
        let (connector, mut accepted) = MemoryConnector::new();
        let bridge = bridge_with(&connector, Some("my.host.com"));
        let (relay_side, client_side) = tokio::io::duplex(64 * 1024);
        let mut relay = Peer::new(relay_side);
        let cancel = CancellationToken::new();

        let task = {
            let bridge = Arc::clone(&bridge);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                bridge
                    .run(client_side, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n", &cancel)
                    .await
            })
        };

        let mut local = accepted.next_to(&ServerAddr::new("local", 3001)).await;
        assert_eq!(
            local.read_chunk().await,
            b"GET / HTTP/1.1\r\nHost: my.host.com\r\n\r\n"
        );

        relay.write(b"GET /two HTTP/1.1\r\nHost: localhost:8080\r\n\r\n").await;
        assert_eq!(
            local.read_chunk().await,
            b"GET /two HTTP/1.1\r\nHost: my.host.com:8080\r\n\r\n"
        );

        local.write(b"HTTP/1.1 200 OK\r\nHost: localhost\r\n\r\n").await;
        assert_eq!(
            relay.read_chunk().await,
            b"HTTP/1.1 200 OK\r\nHost: localhost\r\n\r\n"
        );

        drop(local);
        task.await.unwrap().unwrap();
        assert!(relay.is_closed().await);
    }

    #[tokio::test]
    async fn remote_close_tears_down_local() {
        let (connector, mut accepted) = MemoryConnector::new();
        let bridge = bridge_with(&connector, None);
        let (relay_side, client_side) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();

        let task = {
            let bridge = Arc::clone(&bridge);
            let cancel = cancel.clone();
            tokio::spawn(async move { bridge.run(client_side, b"hello", &cancel).await })
        };

        let mut local = accepted.next_to(&ServerAddr::new("local", 3001)).await;
        assert_eq!(local.read_chunk().await, b"hello");

        drop(relay_side);
        task.await.unwrap().unwrap();
        assert!(local.is_closed().await);
    }

    #[tokio::test]
    async fn cancellation_closes_both_sockets() {
        let (connector, mut accepted) = MemoryConnector::new();
        let bridge = bridge_with(&connector, None);
        let (relay_side, client_side) = tokio::io::duplex(64 * 1024);
        let mut relay = Peer::new(relay_side);
        let cancel = CancellationToken::new();

        let task = {
            let bridge = Arc::clone(&bridge);
            let cancel = cancel.clone();
            tokio::spawn(async move { bridge.run(client_side, b"x", &cancel).await })
        };

        let mut local = accepted.next_to(&ServerAddr::new("local", 3001)).await;
        local.read_chunk().await;

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(local.is_closed().await);
        assert!(relay.is_closed().await);
    }

    #[tokio::test]
    async fn unreachable_local_service_fails_only_this_bridge() {
        let (connector, _accepted) = MemoryConnector::new();
        connector.refuse(&ServerAddr::new("local", 3001));
        let bridge = bridge_with(&connector, None);
        let (relay_side, client_side) = tokio::io::duplex(1024);
        let mut relay = Peer::new(relay_side);

        let result = bridge.run(client_side, b"x", &CancellationToken::new()).await;
        assert!(result.is_err());
        assert!(relay.is_closed().await);
    }
}
