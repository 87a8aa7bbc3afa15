//! Session Agent
//!
//! Runs a [`Session`] on the tokio runtime: one task drains the inbound
//! queue into the session, another polls the relay for available devices.
//! Session events are forwarded to a bounded channel for the host.

use crate::adapters::outbound::{RelayTransport, TcpDirectTransport};
use crate::domain::entities::{DeviceType, PeerId};
use crate::domain::ports::{Inbound, KeyValueStore, RelayClient};
use crate::infrastructure::ShutdownController;
use crate::replication::config::SessionConfig;
use crate::replication::events::SessionEvent;
use crate::replication::session::Session;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::interval;

/// Time given to direct channels to wind down on stop.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Async driver around a session.
pub struct SessionAgent {
    session: Arc<Mutex<Session>>,
    relay: Arc<dyn RelayClient>,
    direct: Option<Arc<TcpDirectTransport>>,
    poll_interval: Duration,
    inbound_rx: Option<mpsc::UnboundedReceiver<Inbound>>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    shutdown: ShutdownController,
}

impl SessionAgent {
    /// Create the session and, when configured, bind the direct listener.
    pub async fn new(
        config: SessionConfig,
        relay: Arc<dyn RelayClient>,
        store: Arc<dyn KeyValueStore>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let shutdown = ShutdownController::new();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let poll_interval = config.poll_interval;
        let listen = config.direct_listen_addr;

        let relay_transport = Arc::new(RelayTransport::new(relay.clone()));
        let mut session = Session::new(config, relay_transport, store, inbound_tx.clone())?;

        let direct = match listen {
            Some(addr) => {
                let transport =
                    TcpDirectTransport::bind(addr, session.peer_id().clone(), inbound_tx, shutdown.clone()).await?;
                session = session.with_direct_transport(transport.clone(), Some(transport.local_addr()));
                Some(transport)
            }
            None => None,
        };

        session.subscribe_all(move |event| match event_tx.try_send(event.clone()) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(dropped)) => {
                tracing::warn!("event queue full, dropping {:?}", dropped.kind());
            }
        });

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            relay,
            direct,
            poll_interval,
            inbound_rx: Some(inbound_rx),
            event_rx: Some(event_rx),
            shutdown,
        })
    }

    /// Get the event receiver. Only the first call returns it.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Shared handle to the session.
    pub fn session(&self) -> Arc<Mutex<Session>> {
        self.session.clone()
    }

    /// Run `f` with the session locked.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut *self.session.lock())
    }

    pub fn peer_id(&self) -> PeerId {
        self.session.lock().peer_id().clone()
    }

    /// Address the direct listener is bound to.
    pub fn direct_addr(&self) -> Option<SocketAddr> {
        self.direct.as_ref().map(|d| d.local_addr())
    }

    pub fn is_running(&self) -> bool {
        self.inbound_rx.is_none() && !self.shutdown.is_shutdown()
    }

    /// Start the session and its background tasks.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let Some(inbound_rx) = self.inbound_rx.take() else {
            anyhow::bail!("session agent already started");
        };

        self.session.lock().start()?;
        tracing::info!(
            "session agent started peer={} direct={:?}",
            self.peer_id(),
            self.direct_addr()
        );

        self.start_event_loop(inbound_rx);
        self.start_poll_loop();
        Ok(())
    }

    /// Stop the background tasks, close every connection and leave the relay.
    pub async fn stop(&self) {
        if self.shutdown.is_shutdown() {
            return;
        }
        tracing::info!("stopping session agent");
        self.shutdown.shutdown();
        self.session.lock().teardown();
        self.shutdown.wait_for_drain(DRAIN_TIMEOUT).await;
    }

    /// Ask the relay for its peers and refresh the available device list.
    pub async fn refresh_available(&self) -> anyhow::Result<usize> {
        let peers = self.relay.list_peers().await?;
        let mut session = self.session.lock();
        session.refresh_available(peers);
        Ok(session.available_devices().len())
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    fn start_event_loop(&self, mut inbound_rx: mpsc::UnboundedReceiver<Inbound>) {
        let session = self.session.clone();
        let mut stop = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    input = inbound_rx.recv() => match input {
                        Some(input) => session.lock().handle_input(input),
                        None => break,
                    },
                }
            }
            tracing::debug!("session event loop finished");
        });
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    fn start_poll_loop(&self) {
        let session = self.session.clone();
        let relay = self.relay.clone();
        let mut stop = self.shutdown.subscribe();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            let mut timer = interval(poll_interval);

            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    _ = timer.tick() => match relay.list_peers().await {
                        Ok(peers) => session.lock().refresh_available(peers),
                        Err(e) => tracing::warn!("failed to list relay peers: {}", e),
                    },
                }
            }
        });
    }
}

/// Builder for SessionAgent with fluent API.
pub struct SessionAgentBuilder {
    config: SessionConfig,
}

impl SessionAgentBuilder {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            config: SessionConfig::new(peer_id),
        }
    }

    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.config = self.config.device_name(name);
        self
    }

    pub fn device_type(mut self, device_type: DeviceType) -> Self {
        self.config = self.config.device_type(device_type);
        self
    }

    pub fn default_role(mut self, role: impl Into<String>) -> Self {
        self.config = self.config.default_role(role);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config = self.config.poll_interval(interval);
        self
    }

    pub fn reconnect(mut self, reconnect: bool) -> Self {
        self.config = self.config.reconnect(reconnect);
        self
    }

    pub fn direct_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.config = self.config.direct_listen_addr(addr);
        self
    }

    pub async fn build(
        self,
        relay: Arc<dyn RelayClient>,
        store: Arc<dyn KeyValueStore>,
    ) -> anyhow::Result<SessionAgent> {
        SessionAgent::new(self.config, relay, store).await
    }
}
