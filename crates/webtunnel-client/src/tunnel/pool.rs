//! Pool of pre-opened, pre-authenticated data connections.
//!
//! Each slot owns one relay connection that has sent its handshake and is
//! waiting for the relay to select it. The first bytes the relay writes are
//! the selection signal: the slot is released, a replacement is opened right
//! away, and the connection is handed to a [`RequestBridge`] together with
//! those bytes.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, debug, debug_span, warn};
use webtunnel_core::Identity;
use webtunnel_core::protocol::Handshake;

use super::bridge::RequestBridge;
use super::config::TunnelConfig;
use super::connector::Connector;

/// Stable handle of a pool slot.
pub type SlotId = u64;

/// Longest selection payload echoed into debug logs.
const PREVIEW_LIMIT: usize = 256;

/// Self-replenishing set of idle relay connections.
pub struct ConnectionPool<C> {
    inner: Arc<PoolInner<C>>,
}

struct PoolInner<C> {
    connector: Arc<C>,
    config: Arc<TunnelConfig>,
    identity: Identity,
    bridge: Arc<RequestBridge<C>>,
    bridges: TaskTracker,
    /// Live slots; the token closes the slot's connection.
    slots: Mutex<HashMap<SlotId, CancellationToken>>,
    next_slot: AtomicU64,
    cancel: CancellationToken,
    /// Parent of every slot span, whichever task opens the slot.
    span: Span,
}

impl<C: Connector> ConnectionPool<C> {
    /// Create an empty pool.
    ///
    /// Selected connections are bridged on tasks spawned into `bridges`.
    /// Cancelling `cancel` closes every slot and every bridge started from
    /// this pool. Slot spans are children of the span current at creation.
    pub fn new(
        connector: Arc<C>,
        config: Arc<TunnelConfig>,
        identity: Identity,
        bridges: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        let bridge = Arc::new(RequestBridge::new(Arc::clone(&connector), &config));
        Self {
            inner: Arc::new(PoolInner {
                connector,
                config,
                identity,
                bridge,
                bridges,
                slots: Mutex::new(HashMap::new()),
                next_slot: AtomicU64::new(0),
                cancel,
                span: Span::current(),
            }),
        }
    }

    /// Open slots until `target` exist.
    pub fn fill(&self, target: usize) {
        let missing = target.saturating_sub(self.len());
        for _ in 0..missing {
            self.inner.open_slot();
        }
        debug!(size = target, "Connection pool filled");
    }

    /// Number of slots not yet consumed.
    pub fn len(&self) -> usize {
        self.inner.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every connection that has not been selected yet.
    pub fn close(&self) {
        let drained: Vec<_> = self.inner.slots().drain().collect();
        for (_, token) in &drained {
            token.cancel();
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "Closed pooled connections");
        }
    }
}

impl<C: Connector> PoolInner<C> {
    fn slots(&self) -> MutexGuard<'_, HashMap<SlotId, CancellationToken>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_slot(self: &Arc<Self>) {
        let (id, token) = {
            let mut slots = self.slots();
            if self.cancel.is_cancelled() {
                return;
            }
            let id = self.next_slot.fetch_add(1, Ordering::Relaxed);
            let token = self.cancel.child_token();
            slots.insert(id, token.clone());
            (id, token)
        };

        let pool = Arc::clone(self);
        tokio::spawn(
            async move { pool.run_slot(id, token).await }
                .instrument(debug_span!(parent: &self.span, "slot", slot = id)),
        );
    }

    /// Remove a slot; `false` if it was already gone (pool closed).
    fn release(&self, id: SlotId) -> bool {
        self.slots().remove(&id).is_some()
    }

    async fn run_slot(self: Arc<Self>, id: SlotId, token: CancellationToken) {
        let selected = tokio::select! {
            () = token.cancelled() => return,
            selected = self.await_selection() => selected,
        };

        match selected {
            Ok((remote, first_chunk)) => {
                if !self.release(id) {
                    return;
                }
                // Replace before bridging so local latency never drains the pool.
                self.open_slot();

                if self.config.debug {
                    let preview = &first_chunk[..first_chunk.len().min(PREVIEW_LIMIT)];
                    debug!(payload = %String::from_utf8_lossy(preview), "Incoming message");
                }

                let bridge = Arc::clone(&self.bridge);
                let cancel = self.cancel.child_token();
                self.bridges.spawn(
                    async move {
                        if let Err(e) = bridge.run(remote, &first_chunk, &cancel).await {
                            warn!(error = %e, "Bridge closed with error");
                        }
                        debug!("Bridge finished");
                    }
                    .in_current_span(),
                );
            }
            Err(e) => {
                if !self.release(id) {
                    return;
                }
                warn!(error = %e, "Pooled connection failed before selection");
                tokio::select! {
                    () = self.cancel.cancelled() => {}
                    () = tokio::time::sleep(self.config.pool_retry_delay) => self.open_slot(),
                }
            }
        }
    }

    /// Connect, authenticate and wait for the relay's first bytes.
    async fn await_selection(&self) -> io::Result<(C::Stream, Vec<u8>)> {
        let mut stream = self.connector.connect(&self.config.remote_server).await?;
        let handshake = Handshake::new(&self.identity)
            .to_bytes()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        stream.write_all(&handshake).await?;
        debug!(remote = %self.config.remote_server, "New connection was added to pool");

        let mut buf = vec![0u8; self.config.read_buffer_size];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "relay closed pooled connection",
            ));
        }
        buf.truncate(n);
        Ok((stream, buf))
    }
}
