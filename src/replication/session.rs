//! Session
//!
//! Root of a peer's participation in a shared session: owns the identity,
//! wires registry, roles and sync engine together, and exposes the host API.
//!
//! A session is a synchronous state machine. Transports and the relay
//! deliver their events on one queue; each event is handled to completion
//! by [`Session::handle_input`].

use crate::adapters::outbound::RelayTransport;
use crate::domain::entities::{DeviceInfo, DeviceTally, DeviceType, PeerId, PeerInfo};
use crate::domain::ports::{
    Announcement, ChannelError, ChannelEvent, ChannelEventKind, Inbound, InboundSink, KeyValueStore, RelayEvent,
    Transport, TransportChannel, TransportError,
};
use crate::domain::value_objects::{ChannelId, Envelope, RoleSubscription};
use crate::replication::config::{ConfigError, SessionConfig};
use crate::replication::events::{EventBus, EventKind, SessionEvent, SubscriptionId};
use crate::replication::registry::{AcceptOutcome, Connection, ConnectionRegistry};
use crate::replication::roles::RoleManager;
use crate::replication::router::{self, BroadcastReport};
use crate::replication::sync::{OutboundSync, SyncEngine, SyncError, SyncOptions};
use crate::replication::types::{Message, ProtocolError, RoleCommand, RoleConfiguration, RoleOperation};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Store key of the persisted peer id.
pub const DEVICE_ID_KEY: &str = "deviceId";
/// Store key of the persisted device name.
pub const DEVICE_NAME_KEY: &str = "deviceName";
/// Store key of the persisted peer list (JSON array of ids).
pub const PEERS_KEY: &str = "peers";

/// Errors surfaced by the session API.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("not connected to {0}")]
    NotConnected(PeerId),
}

/// A peer's session state.
pub struct Session {
    pub(super) config: SessionConfig,
    pub(super) device: DeviceInfo,
    pub(super) registry: ConnectionRegistry,
    pub(super) roles: RoleManager,
    pub(super) sync: SyncEngine,
    pub(super) events: EventBus,
    pub(super) relay: Arc<RelayTransport>,
    pub(super) direct: Option<Arc<dyn Transport>>,
    pub(super) advertised_addr: Option<SocketAddr>,
    pub(super) store: Arc<dyn KeyValueStore>,
    pub(super) sink: InboundSink,
    pub(super) stored_peers: Vec<PeerId>,
    pub(super) available: Vec<PeerInfo>,
    pub(super) others_devices: DeviceTally,
    pub(super) started: bool,
}

impl Session {
    /// Create a session. Nothing is sent until [`start`](Self::start).
    ///
    /// The peer id comes from the configuration, else from the store, else
    /// it is generated; the result is written back to the store.
    pub fn new(
        config: SessionConfig,
        relay: Arc<RelayTransport>,
        store: Arc<dyn KeyValueStore>,
        sink: InboundSink,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let peer_id = if !config.peer_id.is_empty() {
            PeerId::new(config.peer_id.clone())
        } else {
            store
                .get(DEVICE_ID_KEY)
                .filter(|id| !id.is_empty())
                .map(PeerId::new)
                .unwrap_or_else(PeerId::generate)
        };
        store.set(DEVICE_ID_KEY, peer_id.to_string());

        let name = if !config.device_name.is_empty() {
            config.device_name.clone()
        } else {
            store
                .get(DEVICE_NAME_KEY)
                .unwrap_or_else(|| peer_id.to_string())
        };
        store.set(DEVICE_NAME_KEY, name.clone());

        let stored_peers = load_peers(store.as_ref());
        let device = DeviceInfo::new(peer_id.clone(), name, config.device_type);

        Ok(Self {
            registry: ConnectionRegistry::new(peer_id, config.comparator()),
            roles: RoleManager::new(config.default_role.clone()),
            sync: SyncEngine::new(),
            events: EventBus::new(),
            relay,
            direct: None,
            advertised_addr: None,
            store,
            sink,
            stored_peers,
            available: Vec::new(),
            others_devices: DeviceTally::default(),
            started: false,
            device,
            config,
        })
    }

    /// Dial peers directly when their address is known. `advertised` is
    /// published to the relay so others can dial us.
    pub fn with_direct_transport(mut self, transport: Arc<dyn Transport>, advertised: Option<SocketAddr>) -> Self {
        self.direct = Some(transport);
        self.advertised_addr = advertised;
        self
    }

    // ==================== Lifecycle ====================

    /// Identify with the relay, declare the default role and announce the
    /// device. Connects to stored peers when configured to reconnect.
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.identify()?;

        let default_role = self.roles.default_role().to_string();
        if !self.add_role(&default_role) {
            self.announce(Announcement::Roles(self.roles.declared().to_vec()));
        }
        self.announce(Announcement::Device(self.device.clone()));
        self.started = true;
        tracing::info!("session {} started", self.peer_id());

        if self.config.reconnect {
            self.connect_to_stored_peers();
        }
        Ok(())
    }

    /// Close every connection and leave the relay.
    pub fn teardown(&mut self) {
        self.disconnect_all();
        self.relay.relay().disconnect(self.registry.me());
        self.started = false;
        tracing::info!("session {} stopped", self.peer_id());
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    fn identify(&self) -> Result<(), SessionError> {
        let mut info = PeerInfo::new(self.peer_id().clone()).with_addr(self.advertised_addr);
        info.name = Some(self.device.name.clone());
        info.device_type = Some(self.device.device_type);
        self.relay.relay().identify(info, self.sink.clone())?;
        Ok(())
    }

    // ==================== Identity and device ====================

    pub fn peer_id(&self) -> &PeerId {
        self.registry.me()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Update the device class and viewport, then announce it.
    pub fn set_device(&mut self, device_type: DeviceType, width: u32, height: u32) {
        self.device.device_type = device_type;
        self.device.width = width;
        self.device.height = height;
        self.send_device();
    }

    /// Rename this device. Returns false if the name did not change.
    pub fn change_name(&mut self, name: &str) -> bool {
        if self.device.name == name {
            return false;
        }
        self.device.name = name.to_string();
        self.store.set(DEVICE_NAME_KEY, name.to_string());
        self.send_device();
        true
    }

    /// Take a new peer id: drop every connection and re-identify.
    pub fn change_peer_id(&mut self, new_id: PeerId) -> Result<bool, SessionError> {
        if new_id == *self.peer_id() {
            return Ok(false);
        }
        if new_id.as_str().is_empty() || new_id.as_str().chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidPeerId(new_id.to_string()).into());
        }

        tracing::info!("changing peer id {} -> {}", self.peer_id(), new_id);
        self.disconnect_all();
        self.relay.relay().disconnect(self.registry.me());

        self.registry.set_me(new_id.clone());
        self.device.id = new_id.clone();
        self.store.set(DEVICE_ID_KEY, new_id.to_string());

        if self.started {
            self.identify()?;
            self.announce(Announcement::Device(self.device.clone()));
            self.announce(Announcement::Roles(self.roles.declared().to_vec()));
            self.announce(Announcement::RoleConfigs(self.roles.configured_ids()));
        }
        Ok(true)
    }

    fn send_device(&mut self) {
        let envelope = Message::Device(self.device.clone()).into_envelope();
        self.broadcast(&envelope);
        self.announce(Announcement::Device(self.device.clone()));
    }

    // ==================== Synchronized values ====================

    /// Start synchronizing `value`. Returns its id.
    pub fn synchronize(&mut self, value: Value, options: SyncOptions) -> Result<String, SessionError> {
        Ok(self.sync.track(value, options)?)
    }

    pub fn value(&self, id: &str) -> Option<&Value> {
        self.sync.value(id)
    }

    /// Mutable access without propagation; call
    /// [`flush_changes`](Self::flush_changes) afterwards.
    pub fn value_mut(&mut self, id: &str) -> Option<&mut Value> {
        self.sync.value_mut(id)
    }

    /// Mutate a tracked value and propagate the change.
    pub fn update<F>(&mut self, id: &str, mutate: F) -> Result<bool, SessionError>
    where
        F: FnOnce(&mut Value),
    {
        let value = self
            .sync
            .value_mut(id)
            .ok_or_else(|| SyncError::UnknownEntry(id.to_string()))?;
        mutate(value);

        match self.sync.take_change(id)? {
            Some(outbound) => {
                self.propagate(outbound);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Propagate every pending local change. Returns how many values changed.
    pub fn flush_changes(&mut self) -> usize {
        let changes = self.sync.take_changes();
        let count = changes.len();
        for outbound in changes {
            self.propagate(outbound);
        }
        count
    }

    /// Push the full value of `id` to every interested peer.
    pub fn force_update(&mut self, id: &str) -> Result<(), SessionError> {
        let outbound = self.sync.force(id)?;
        self.propagate(outbound);
        Ok(())
    }

    /// Forget pending local changes of `id`.
    pub fn discard_changes(&mut self, id: &str) -> Result<(), SessionError> {
        Ok(self.sync.discard_changes(id)?)
    }

    pub(super) fn propagate(&mut self, outbound: OutboundSync) {
        let envelope = outbound.to_message().into_envelope();
        let report = router::send_to_interested(&self.registry, &self.roles, &envelope, &outbound.id);
        tracing::debug!(
            "sync {} (delta={}) sent to {} peers",
            outbound.id,
            outbound.is_delta,
            report.delivered.len()
        );

        if outbound.forward_to_relay {
            self.announce(Announcement::Sync {
                envelope,
                interested: report.delivered.clone(),
            });
        }
        self.reap(report);
        self.events.emit(SessionEvent::SyncData(outbound.id));
    }

    // ==================== Roles ====================

    /// Declare a role. Returns false if it was already declared.
    pub fn add_role(&mut self, role: &str) -> bool {
        let changed = self.roles.declare(role);
        if changed {
            self.send_roles();
        }
        changed
    }

    /// Retract a role. Returns false if it was not declared.
    pub fn remove_role(&mut self, role: &str) -> bool {
        let changed = self.roles.retract(role);
        if changed {
            self.send_roles();
        }
        changed
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.has_role(role)
    }

    pub fn roles(&self) -> &[String] {
        self.roles.declared()
    }

    /// Configure which data ids `role` receives, optionally with handlers.
    pub fn configure_role<I, S>(&mut self, role: &str, subscriptions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<RoleSubscription>,
    {
        let configurations = self.roles.configure_role(role, subscriptions);
        self.announce(Announcement::RoleConfigs(self.roles.configured_ids()));

        let envelope = Message::RoleConfigurations(RoleConfiguration {
            role: role.to_string(),
            configurations,
        })
        .into_envelope();
        self.broadcast(&envelope);
    }

    /// Connected peers holding `role`, in rank order.
    pub fn other_has_role(&self, role: &str) -> Vec<PeerId> {
        self.registry
            .open_connections()
            .filter(|c| c.has_role(role))
            .map(|c| c.id.clone())
            .collect()
    }

    /// Ask `peer` to add or remove a role on itself.
    pub fn change_role_for_peer(&mut self, role: &str, add: bool, peer: &PeerId) -> Result<(), SessionError> {
        let operation = if add { RoleOperation::Add } else { RoleOperation::Remove };
        let envelope = Message::Role(RoleCommand {
            operation,
            role: role.to_string(),
        })
        .into_envelope();
        self.send_to(peer, &envelope)
    }

    /// Role -> number of connected peers holding it.
    pub fn others_roles(&self) -> &BTreeMap<String, usize> {
        self.roles.others_roles()
    }

    /// Device classes of connected peers.
    pub fn others_devices(&self) -> DeviceTally {
        self.others_devices
    }

    fn send_roles(&mut self) {
        let roles = self.roles.declared().to_vec();
        let envelope = Message::Roles(roles.clone()).into_envelope();
        self.broadcast(&envelope);
        self.announce(Announcement::Roles(roles));
    }

    // ==================== Connections ====================

    /// Start connecting to `peer`. Returns false for the benign cases
    /// (self, already connected or attempting, unknown peer).
    pub fn connect_to(&mut self, peer: &PeerId) -> Result<bool, SessionError> {
        let transport = self.transport_for(peer);
        match self.registry.connect_to(peer, transport.as_ref(), self.sink.clone()) {
            Ok(started) => Ok(started),
            Err(TransportError::PeerUnavailable(unknown)) => {
                tracing::info!("could not connect to peer {}", unknown);
                self.events.emit(SessionEvent::PeerUnavailable(unknown));
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Close the connection to `peer`. Returns false if there was none.
    pub fn disconnect(&mut self, peer: &PeerId) -> bool {
        match self.registry.remove(peer) {
            Some(conn) => {
                self.connection_removed(conn);
                true
            }
            None => false,
        }
    }

    pub fn disconnect_all(&mut self) {
        for peer in self.registry.all_ids() {
            self.disconnect(&peer);
        }
    }

    /// Send an opaque message to every open connection.
    pub fn send_to_all(&mut self, kind: &str, data: Value) -> BroadcastReport {
        let envelope = Envelope::new(kind, data);
        self.broadcast(&envelope)
    }

    /// Open peers in rank order.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.registry.open_ids()
    }

    /// Peers with a pending connection attempt.
    pub fn attempting_peers(&self) -> Vec<PeerId> {
        self.registry.attempting_ids()
    }

    pub fn connection(&self, peer: &PeerId) -> Option<&Connection> {
        self.registry.get(peer)
    }

    /// Position of this peer in the ranking of connected peers plus self.
    pub fn my_position(&self) -> usize {
        self.registry.my_position()
    }

    /// Connected peers plus self in rank order.
    pub fn peer_order(&self) -> Vec<PeerId> {
        self.registry.order().full_order(self.registry.me())
    }

    /// Peers the relay knows about that we are not connected to.
    pub fn available_devices(&self) -> &[PeerInfo] {
        &self.available
    }

    /// Replace the available device list with the relay's peer list.
    pub fn refresh_available(&mut self, peers: Vec<PeerInfo>) {
        for peer in &peers {
            if let Some(direct) = &self.direct {
                direct.learn(peer);
            }
        }

        let me = self.registry.me().clone();
        self.available = peers
            .into_iter()
            .filter(|p| p.id != me && !self.registry.get(&p.id).is_some_and(Connection::is_open))
            .collect();
        self.events.emit(SessionEvent::AvailableDevices(self.available.len()));
    }

    // ==================== Stored peers ====================

    pub fn stored_peers(&self) -> &[PeerId] {
        &self.stored_peers
    }

    /// Connect to every stored peer. Returns how many attempts started.
    pub fn connect_to_stored_peers(&mut self) -> usize {
        let mut started = 0;
        for peer in self.stored_peers.clone() {
            match self.connect_to(&peer) {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("reconnect to {} failed: {}", peer, e),
            }
        }
        started
    }

    pub fn remove_stored_peer(&mut self, peer: &PeerId) -> bool {
        let before = self.stored_peers.len();
        self.stored_peers.retain(|p| p != peer);
        let removed = before != self.stored_peers.len();
        if removed {
            self.save_peers();
        }
        removed
    }

    fn store_peer(&mut self, peer: &PeerId) {
        if !self.stored_peers.contains(peer) {
            self.stored_peers.push(peer.clone());
            self.save_peers();
        }
    }

    fn save_peers(&self) {
        match serde_json::to_string(&self.stored_peers) {
            Ok(json) => self.store.set(PEERS_KEY, json),
            Err(e) => tracing::warn!("failed to persist peers: {}", e),
        }
    }

    // ==================== Events ====================

    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&SessionEvent) + Send + 'static,
    {
        self.events.subscribe(kind, handler)
    }

    pub fn subscribe_all<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&SessionEvent) + Send + 'static,
    {
        self.events.subscribe_all(handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    // ==================== Inbound ====================

    /// Handle one transport or relay event to completion.
    pub fn handle_input(&mut self, input: Inbound) {
        match input {
            Inbound::Channel(event) => self.handle_channel_event(event),
            Inbound::Relay(event) => self.handle_relay_event(event),
            Inbound::Incoming(channel) => self.accept(channel),
        }
    }

    fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::ConnectRequest { sender } => {
                tracing::debug!("relay connect request from {}", sender);
                let channel = self.relay.accept(self.registry.me(), &sender);
                self.accept(channel);
            }
            RelayEvent::Wrapped {
                sender,
                event_tag,
                payload,
            } => {
                if let Some(event) = self.relay.translate(&sender, event_tag, payload) {
                    self.handle_channel_event(event);
                }
            }
            RelayEvent::PeerUnavailable(peer) => {
                tracing::info!("could not connect to peer {}", peer);
                if self.registry.is_attempting(&peer) {
                    if let Some(conn) = self.registry.remove(&peer) {
                        conn.channel().close();
                        self.relay.forget(&peer, conn.channel_id());
                    }
                }
                self.events.emit(SessionEvent::PeerUnavailable(peer));
            }
            RelayEvent::Error(reason) => {
                tracing::warn!("relay error: {}", reason);
                self.events.emit(SessionEvent::Error { peer: None, reason });
            }
        }
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        let ChannelEvent { peer, channel, kind } = event;
        match kind {
            ChannelEventKind::Opened => self.connection_opened(&peer, channel),
            ChannelEventKind::Data(envelope) => {
                let current = self
                    .registry
                    .get(&peer)
                    .is_some_and(|c| c.channel_id() == channel && c.is_open());
                if current {
                    self.route(&peer, envelope);
                } else {
                    tracing::debug!("dropping {} from {} on inactive channel {}", envelope.kind, peer, channel);
                }
            }
            ChannelEventKind::Closed => {
                if let Some(conn) = self.registry.remove_channel(&peer, channel) {
                    self.connection_removed(conn);
                }
            }
            ChannelEventKind::Error(reason) => {
                tracing::warn!("error on connection to {}: {}", peer, reason);
                self.events.emit(SessionEvent::Error {
                    peer: Some(peer.clone()),
                    reason,
                });

                let attempting = self
                    .registry
                    .get(&peer)
                    .is_some_and(|c| c.channel_id() == channel && !c.opened);
                if attempting {
                    if let Some(conn) = self.registry.remove_channel(&peer, channel) {
                        self.connection_removed(conn);
                    }
                }
                self.sweep_stale();
            }
        }
    }

    fn accept(&mut self, channel: Arc<dyn TransportChannel>) {
        let peer = channel.peer_id().clone();
        let id = channel.id();
        let open = channel.is_open();

        match self.registry.accept_incoming(channel) {
            AcceptOutcome::Registered | AcceptOutcome::Merged => {}
            AcceptOutcome::Replaced(displaced) => self.connection_removed(displaced),
            AcceptOutcome::Rejected => return,
        }
        if open {
            self.connection_opened(&peer, id);
        }
    }

    fn connection_opened(&mut self, peer: &PeerId, channel: ChannelId) {
        if !self.registry.mark_open(peer, channel) {
            return;
        }
        tracing::info!("connection to {} opened", peer);
        self.events.emit(SessionEvent::Connected(peer.clone()));
        self.store_peer(peer);

        let others: Vec<PeerId> = self.registry.open_ids().into_iter().filter(|p| p != peer).collect();
        let greeting = [
            Message::Connections(others).into_envelope(),
            Message::Roles(self.roles.declared().to_vec()).into_envelope(),
            Message::Device(self.device.clone()).into_envelope(),
        ];
        for envelope in &greeting {
            if let Err(e) = self.send_to(peer, envelope) {
                tracing::warn!("failed to greet {}: {}", peer, e);
                break;
            }
        }
    }

    /// Bookkeeping for a connection that left the registry.
    pub(super) fn connection_removed(&mut self, conn: Connection) {
        conn.channel().close();
        if conn.channel().kind() == crate::domain::ports::ChannelKind::Relayed {
            self.relay.forget(&conn.id, conn.channel_id());
        }

        if self.roles.update_role_counts(&conn.roles, &[]) {
            self.events
                .emit(SessionEvent::OthersRolesChanged(self.roles.others_roles().clone()));
        }
        if let Some(device) = &conn.device {
            self.others_devices.decrement(device.device_type);
        }

        if conn.opened {
            tracing::info!("connection to {} closed", conn.id);
            self.events.emit(SessionEvent::Disconnected(conn.id));
        } else {
            tracing::info!("could not connect to peer {}", conn.id);
            self.events.emit(SessionEvent::PeerUnavailable(conn.id));
        }
    }

    /// Drop open connections whose channel went away silently.
    pub fn sweep_stale(&mut self) -> usize {
        let stale = self.registry.sweep_stale();
        let count = stale.len();
        for conn in stale {
            tracing::debug!("removing stale connection to {}", conn.id);
            self.connection_removed(conn);
        }
        count
    }

    // ==================== Outbound ====================

    pub(super) fn send_to(&mut self, peer: &PeerId, envelope: &Envelope) -> Result<(), SessionError> {
        let conn = self
            .registry
            .get(peer)
            .filter(|c| c.is_open())
            .ok_or_else(|| SessionError::NotConnected(peer.clone()))?;

        if let Err(e) = conn.send(envelope) {
            tracing::warn!("send to {} failed: {}", peer, e);
            if matches!(e, ChannelError::Closed(_)) {
                self.sweep_stale();
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub(super) fn broadcast(&mut self, envelope: &Envelope) -> BroadcastReport {
        let report = router::send_to_all(&self.registry, envelope);
        self.reap(report.clone());
        report
    }

    /// Remove connections a broadcast found closed.
    fn reap(&mut self, report: BroadcastReport) {
        for peer in report.stale {
            if let Some(conn) = self.registry.remove(&peer) {
                self.connection_removed(conn);
            }
        }
    }

    pub(super) fn announce(&self, announcement: Announcement) {
        if let Err(e) = self.relay.relay().announce(self.registry.me(), announcement) {
            tracing::debug!("relay announcement failed: {}", e);
        }
    }

    fn transport_for(&self, peer: &PeerId) -> Arc<dyn Transport> {
        match &self.direct {
            Some(direct) if self.config.prefer_direct && direct.can_reach(peer) => direct.clone(),
            _ => self.relay.clone(),
        }
    }
}

fn load_peers(store: &dyn KeyValueStore) -> Vec<PeerId> {
    let Some(raw) = store.get(PEERS_KEY) else {
        return Vec::new();
    };
    match serde_json::from_str(&raw) {
        Ok(peers) => peers,
        Err(e) => {
            tracing::warn!("ignoring unreadable stored peers: {}", e);
            Vec::new()
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer_id", self.registry.me())
            .field("connected", &self.registry.open_ids())
            .field("roles", &self.roles)
            .field("sync", &self.sync)
            .finish()
    }
}
