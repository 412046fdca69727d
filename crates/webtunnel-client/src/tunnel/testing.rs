//! In-memory transport for driving the tunnel in tests.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use webtunnel_core::ServerAddr;

use super::connector::Connector;

const PIPE_CAPACITY: usize = 256 * 1024;
const PEER_WAIT: Duration = Duration::from_secs(60);

/// Hands every outbound connection's far end to the test.
#[derive(Clone)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<(ServerAddr, DuplexStream)>,
    refused: Arc<Mutex<HashSet<ServerAddr>>>,
    stalled: Arc<Mutex<HashSet<ServerAddr>>>,
}

/// Receiving side of a [`MemoryConnector`].
pub struct Incoming {
    rx: mpsc::UnboundedReceiver<(ServerAddr, DuplexStream)>,
}

impl MemoryConnector {
    pub fn new() -> (Self, Incoming) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                accepted: tx,
                refused: Arc::default(),
                stalled: Arc::default(),
            },
            Incoming { rx },
        )
    }

    /// Make connections to `addr` fail with `ConnectionRefused`.
    pub fn refuse(&self, addr: &ServerAddr) {
        self.refused.lock().unwrap().insert(addr.clone());
    }

    pub fn allow(&self, addr: &ServerAddr) {
        self.refused.lock().unwrap().remove(addr);
        self.stalled.lock().unwrap().remove(addr);
    }

    /// Make connections to `addr` hang forever, like a host dropping SYNs.
    pub fn stall(&self, addr: &ServerAddr) {
        self.stalled.lock().unwrap().insert(addr.clone());
    }
}

impl Connector for MemoryConnector {
    type Stream = DuplexStream;

    async fn connect(&self, addr: &ServerAddr) -> io::Result<DuplexStream> {
        if self.refused.lock().unwrap().contains(addr) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("connect ECONNREFUSED {addr}"),
            ));
        }
        let stalled = self.stalled.lock().unwrap().contains(addr);
        if stalled {
            std::future::pending::<()>().await;
        }
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        self.accepted
            .send((addr.clone(), far))
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "test harness gone"))?;
        Ok(near)
    }
}

impl Incoming {
    /// Next connection opened by the code under test.
    pub async fn next(&mut self) -> (ServerAddr, Peer) {
        let (addr, stream) = tokio::time::timeout(PEER_WAIT, self.rx.recv())
            .await
            .expect("no connection was opened")
            .expect("connector dropped");
        (addr, Peer::new(stream))
    }

    /// Next connection, which must go to `expected`.
    pub async fn next_to(&mut self, expected: &ServerAddr) -> Peer {
        let (addr, peer) = self.next().await;
        assert_eq!(&addr, expected, "connection opened to unexpected address");
        peer
    }

    /// A connection that has already been opened, if any.
    pub fn try_next(&mut self) -> Option<(ServerAddr, Peer)> {
        self.rx
            .try_recv()
            .ok()
            .map(|(addr, stream)| (addr, Peer::new(stream)))
    }
}

/// The test's end of one connection.
pub struct Peer {
    stream: DuplexStream,
}

impl Peer {
    pub const fn new(stream: DuplexStream) -> Self {
        Self { stream }
    }

    /// Whatever the other side has written next. Panics on EOF.
    pub async fn read_chunk(&mut self) -> Vec<u8> {
        let mut buf = vec![0u8; PIPE_CAPACITY];
        let n = tokio::time::timeout(PEER_WAIT, self.stream.read(&mut buf))
            .await
            .expect("peer wrote nothing")
            .expect("read failed");
        assert!(n > 0, "connection closed while expecting data");
        buf.truncate(n);
        buf
    }

    pub async fn write(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Drain until the other side closes. `false` if it stays open.
    pub async fn is_closed(&mut self) -> bool {
        let mut buf = vec![0u8; PIPE_CAPACITY];
        let drained = tokio::time::timeout(PEER_WAIT, async {
            loop {
                match self.stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        })
        .await;
        drained.is_ok()
    }
}
