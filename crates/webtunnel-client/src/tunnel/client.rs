//! Tunnel client that exposes a local service through a relay server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, error, info, info_span, warn};
use webtunnel_core::Identity;

use super::config::TunnelConfig;
use super::connector::{Connector, TcpConnector};
use super::control::{ControlChannel, ControlState};
use super::error::TunnelError;
use super::pool::ConnectionPool;

/// Tunnel client: probes the local service, keeps the control channel up
/// and the data connection pool full.
pub struct Client<C: Connector = TcpConnector> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Connector> {
    config: Arc<TunnelConfig>,
    identity: Identity,
    connector: Arc<C>,
    connected: AtomicBool,
    closed: AtomicBool,
    state: watch::Sender<ControlState>,
    /// Cancelled by `close()`; replaced on every `connect()`.
    lifetime: Mutex<CancellationToken>,
    session: Mutex<Option<Session<C>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    /// Held for the whole of `connect()`.
    connecting: tokio::sync::Mutex<()>,
    span: Span,
}

/// Everything that belongs to one activation of the control channel.
struct Session<C: Connector> {
    cancel: CancellationToken,
    pool: ConnectionPool<C>,
    bridges: TaskTracker,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Client<TcpConnector> {
    pub fn new(config: TunnelConfig, identity: Identity) -> Self {
        Self::with_connector(config, identity, TcpConnector)
    }
}

impl<C: Connector> Client<C> {
    pub fn with_connector(config: TunnelConfig, identity: Identity, connector: C) -> Self {
        let tunnel_id = format!("{}.{}", identity, config.remote_server.host);
        let span = info_span!("tunnel", id = %tunnel_id);
        let (state, _) = watch::channel(ControlState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config: Arc::new(config),
                identity,
                connector: Arc::new(connector),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                state,
                lifetime: Mutex::new(CancellationToken::new()),
                session: Mutex::new(None),
                supervisor: Mutex::new(None),
                connecting: tokio::sync::Mutex::new(()),
                span,
            }),
        }
    }

    /// Public name of the tunnel: `<identity>.<relay host>`.
    pub fn tunnel_id(&self) -> String {
        format!(
            "{}.{}",
            self.shared.identity, self.shared.config.remote_server.host
        )
    }

    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.shared.config
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Current control channel state.
    pub fn state(&self) -> ControlState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ControlState> {
        self.shared.state.subscribe()
    }

    /// Idle data connections currently held.
    pub fn pool_len(&self) -> usize {
        lock(&self.shared.session)
            .as_ref()
            .map_or(0, |s| s.pool.len())
    }

    /// Requests currently being bridged.
    pub fn active_bridges(&self) -> usize {
        lock(&self.shared.session)
            .as_ref()
            .map_or(0, |s| s.bridges.len())
    }

    /// A supervisor task is keeping the tunnel up (possibly reconnecting).
    fn is_supervised(&self) -> bool {
        lock(&self.shared.supervisor)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Open the tunnel.
    ///
    /// Checks that the local service accepts connections, performs the
    /// control handshake and fills the pool. Resolves with the tunnel id.
    /// On failure the client is closed before the error is returned. Once
    /// this has succeeded, a dropped control connection is re-established in
    /// the background until [`close`](Self::close) is called.
    pub async fn connect(&self) -> Result<String, TunnelError> {
        let _connecting = self.shared.connecting.lock().await;
        if !self.is_closed() && self.is_supervised() {
            return Ok(self.tunnel_id());
        }

        self.shared.closed.store(false, Ordering::SeqCst);
        let lifetime = CancellationToken::new();
        let previous = std::mem::replace(&mut *lock(&self.shared.lifetime), lifetime.clone());
        previous.cancel();

        let span = self.shared.span.clone();
        match self.shared.establish(&lifetime).instrument(span.clone()).await {
            Ok(control) => {
                self.shared.connected.store(true, Ordering::SeqCst);
                let id = self.tunnel_id();
                span.in_scope(|| {
                    info!(
                        local = %self.shared.config.local_server,
                        "Connection established"
                    );
                });

                let shared = Arc::clone(&self.shared);
                let handle = tokio::spawn(
                    Shared::supervise(shared, control, lifetime).instrument(span),
                );
                *lock(&self.shared.supervisor) = Some(handle);
                Ok(id)
            }
            Err(e) => {
                span.in_scope(|| error!(error = %e, "Connection failed"));
                self.close().await;
                Err(e)
            }
        }
    }

    /// Shut the tunnel down.
    ///
    /// Stops the heartbeat, closes pooled connections and active bridges,
    /// and returns once the control connection is closed. Calling it again
    /// is a no-op.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.state.send_replace(ControlState::Closing);

        lock(&self.shared.lifetime).cancel();
        self.shared.teardown();

        let supervisor = lock(&self.shared.supervisor).take();
        if let Some(handle) = supervisor
            && let Err(e) = handle.await
        {
            self.shared
                .span
                .in_scope(|| warn!(error = %e, "Control task ended abnormally"));
        }

        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.state.send_replace(ControlState::Disconnected);
        self.shared.span.in_scope(|| info!("Tunnel closed"));
    }
}

impl<C: Connector> Drop for Client<C> {
    fn drop(&mut self) {
        lock(&self.shared.lifetime).cancel();
        self.shared.teardown();
    }
}

impl<C: Connector> Shared<C> {
    /// One connection attempt: local probe, control handshake, pool fill.
    async fn establish(
        &self,
        lifetime: &CancellationToken,
    ) -> Result<ControlChannel<C::Stream>, TunnelError> {
        tokio::select! {
            () = lifetime.cancelled() => return Err(TunnelError::Closed),
            probed = self.probe_local() => probed?,
        }

        let opened = tokio::select! {
            () = lifetime.cancelled() => Err(TunnelError::Closed),
            opened = ControlChannel::open(
                &*self.connector,
                &self.config.remote_server,
                &self.identity,
                self.config.handshake_timeout,
                &self.state,
            ) => opened,
        };
        let control = match opened {
            Ok(control) => control,
            Err(e) => {
                if !lifetime.is_cancelled() {
                    self.state.send_replace(ControlState::Disconnected);
                }
                return Err(e);
            }
        };

        let cancel = lifetime.child_token();
        let bridges = TaskTracker::new();
        let pool = ConnectionPool::new(
            Arc::clone(&self.connector),
            Arc::clone(&self.config),
            self.identity.clone(),
            bridges.clone(),
            cancel.clone(),
        );

        let mut session = lock(&self.session);
        if lifetime.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        pool.fill(self.config.pool_size);
        *session = Some(Session {
            cancel,
            pool,
            bridges,
        });
        Ok(control)
    }

    /// Open and immediately drop a connection to the local service.
    async fn probe_local(&self) -> Result<(), TunnelError> {
        let addr = &self.config.local_server;
        match self.connector.connect(addr).await {
            Ok(stream) => {
                drop(stream);
                Ok(())
            }
            Err(source) => {
                error!(local = %addr, "Could not connect to local server");
                Err(TunnelError::LocalUnreachable {
                    endpoint: addr.clone(),
                    source,
                })
            }
        }
    }

    /// Close the pool and all bridges of the current session.
    fn teardown(&self) {
        let Some(session) = lock(&self.session).take() else {
            return;
        };
        session.pool.close();
        session.cancel.cancel();
        session.bridges.close();
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Run the active control channel; on transport failure tear the
    /// session down and establish a new one, until `lifetime` is cancelled.
    async fn supervise(
        shared: Arc<Self>,
        mut control: ControlChannel<C::Stream>,
        lifetime: CancellationToken,
    ) {
        loop {
            match control
                .run(shared.config.heartbeat_interval, &lifetime)
                .await
            {
                Ok(()) => return,
                Err(e) => {
                    warn!(error = %e, "Control connection lost, reconnecting");
                    shared.teardown();
                    if !lifetime.is_cancelled() {
                        shared.state.send_replace(ControlState::Disconnected);
                    }
                    match shared.reconnect(&lifetime).await {
                        Some(next) => {
                            control = next;
                            shared.connected.store(true, Ordering::SeqCst);
                            info!("Reconnected to relay");
                        }
                        None => return,
                    }
                }
            }
        }
    }

    async fn reconnect(&self, lifetime: &CancellationToken) -> Option<ControlChannel<C::Stream>> {
        let policy = &self.config.reconnect;
        let mut attempt: u32 = 0;

        loop {
            if lifetime.is_cancelled() {
                return None;
            }

            match self.establish(lifetime).await {
                Ok(control) => return Some(control),
                Err(TunnelError::Closed) => return None,
                Err(e) => {
                    if !policy.should_retry(attempt) {
                        error!(error = %e, attempt, "Max reconnect attempts reached");
                        return None;
                    }

                    let delay = policy.delay_for_attempt(attempt);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis(), "Reconnecting");

                    tokio::select! {
                        () = sleep(delay) => {}
                        () = lifetime.cancelled() => return None,
                    }

                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
