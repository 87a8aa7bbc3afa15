//! Connection Registry
//!
//! Owns the set of peers this process is connected to or attempting to
//! connect to, and keeps the deterministic peer ranking up to date.

use crate::domain::entities::{DeviceInfo, PeerId};
use crate::domain::ports::{ChannelError, InboundSink, Transport, TransportChannel, TransportError};
use crate::domain::value_objects::{ChannelId, ConnectionState, Envelope, PeerComparator, PeerOrder};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A peer connection and everything learned from it.
pub struct Connection {
    pub id: PeerId,
    channel: Arc<dyn TransportChannel>,
    pub state: ConnectionState,
    /// Roles last announced by the remote peer
    pub roles: Vec<String>,
    /// Last announced device, if any
    pub device: Option<DeviceInfo>,
    /// Role configurations the remote peer published
    pub role_configurations: BTreeMap<String, Vec<String>>,
    /// Set when the remote initiated the connection
    pub accepted: bool,
    /// Push our state once the remote's roles arrive
    pub pending_initial_sync: bool,
    /// Whether the connection ever reached Open
    pub opened: bool,
}

impl Connection {
    fn new(channel: Arc<dyn TransportChannel>, accepted: bool) -> Self {
        Self {
            id: channel.peer_id().clone(),
            channel,
            state: ConnectionState::Attempting,
            roles: Vec::new(),
            device: None,
            role_configurations: BTreeMap::new(),
            accepted,
            pending_initial_sync: false,
            opened: false,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }

    pub fn channel(&self) -> &Arc<dyn TransportChannel> {
        &self.channel
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Whether the underlying channel still reports open.
    pub fn is_channel_open(&self) -> bool {
        self.channel.is_open()
    }

    pub fn send(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        if !self.channel.is_open() {
            return Err(ChannelError::Closed(self.id.clone()));
        }
        self.channel.send(envelope)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("channel", &self.channel.id())
            .field("kind", &self.channel.kind())
            .field("state", &self.state)
            .field("roles", &self.roles)
            .field("accepted", &self.accepted)
            .field("pending_initial_sync", &self.pending_initial_sync)
            .finish()
    }
}

/// Result of registering a channel the remote peer opened.
#[derive(Debug)]
pub enum AcceptOutcome {
    /// New connection registered
    Registered,
    /// The channel is the one already registered (relay confirms our own attempt)
    Merged,
    /// The incoming channel displaced an existing connection, returned closed
    Replaced(Connection),
    /// A connection already exists; the incoming channel was closed
    Rejected,
}

/// Registry of attempting and open connections.
pub struct ConnectionRegistry {
    me: PeerId,
    connections: HashMap<PeerId, Connection>,
    order: PeerOrder,
}

impl ConnectionRegistry {
    pub fn new(me: PeerId, comparator: PeerComparator) -> Self {
        let mut order = PeerOrder::new(comparator);
        order.recompute(&me, std::iter::empty());
        Self {
            me,
            connections: HashMap::new(),
            order,
        }
    }

    pub fn me(&self) -> &PeerId {
        &self.me
    }

    /// Re-identify; only valid once every connection is gone.
    pub fn set_me(&mut self, me: PeerId) {
        self.me = me;
        self.recompute_order();
    }

    /// Start connecting to `peer` unless a connection already exists.
    ///
    /// Returns `Ok(false)` for the benign duplicate case.
    pub fn connect_to(
        &mut self,
        peer: &PeerId,
        transport: &dyn Transport,
        sink: InboundSink,
    ) -> Result<bool, TransportError> {
        if *peer == self.me {
            tracing::warn!("refusing to connect to self ({})", peer);
            return Ok(false);
        }
        if let Some(existing) = self.connections.get(peer) {
            tracing::warn!("already connected to {} ({:?})", peer, existing.state);
            return Ok(false);
        }

        let channel = transport.connect(&self.me, peer, sink)?;
        tracing::debug!(
            "connecting to {} over {:?} channel {}",
            peer,
            channel.kind(),
            channel.id()
        );
        self.connections
            .insert(peer.clone(), Connection::new(channel, false));
        Ok(true)
    }

    /// Register a channel opened by a remote peer.
    ///
    /// When both sides dial each other at once, the connection initiated by
    /// the lower-ranked peer wins on both ends. A connection whose channel
    /// died silently always gives way.
    pub fn accept_incoming(&mut self, channel: Arc<dyn TransportChannel>) -> AcceptOutcome {
        let peer = channel.peer_id().clone();
        let remote_wins = (self.order.comparator())(&peer, &self.me) == std::cmp::Ordering::Less;

        let Some(existing) = self.connections.get_mut(&peer) else {
            self.connections.insert(peer, Connection::new(channel, true));
            return AcceptOutcome::Registered;
        };

        if existing.channel_id() == channel.id() {
            if existing.state == ConnectionState::Attempting && !remote_wins {
                existing.accepted = true;
            }
            return AcceptOutcome::Merged;
        }

        let stale = existing.is_open() && !existing.is_channel_open();
        if stale || (!existing.accepted && remote_wins) {
            tracing::debug!("keeping incoming channel {} from {}", channel.id(), peer);
            existing.channel.close();
            let mut displaced = std::mem::replace(existing, Connection::new(channel, true));
            let was_open = displaced.is_open();
            displaced.state = ConnectionState::Closed;
            if was_open {
                self.recompute_order();
            }
            return AcceptOutcome::Replaced(displaced);
        }

        tracing::warn!(
            "duplicate connection from {} ({:?}), closing incoming channel",
            peer,
            existing.state
        );
        channel.close();
        AcceptOutcome::Rejected
    }

    /// Attempting -> Open, at most once per connection.
    ///
    /// Events from a channel other than the registered one are ignored.
    pub fn mark_open(&mut self, peer: &PeerId, channel: ChannelId) -> bool {
        let opened = match self.connections.get_mut(peer) {
            Some(conn) if conn.channel_id() == channel && conn.state == ConnectionState::Attempting => {
                conn.state = ConnectionState::Open;
                conn.opened = true;
                conn.pending_initial_sync = conn.accepted;
                true
            }
            _ => false,
        };
        if opened {
            self.recompute_order();
        }
        opened
    }

    /// Remove a connection in any state. The returned connection is Closed.
    pub fn remove(&mut self, peer: &PeerId) -> Option<Connection> {
        let mut conn = self.connections.remove(peer)?;
        let was_open = conn.state == ConnectionState::Open;
        conn.state = ConnectionState::Closed;
        if was_open {
            self.recompute_order();
        }
        Some(conn)
    }

    /// Remove only if `channel` is still the registered channel for `peer`.
    pub fn remove_channel(&mut self, peer: &PeerId, channel: ChannelId) -> Option<Connection> {
        match self.connections.get(peer) {
            Some(conn) if conn.channel_id() == channel => self.remove(peer),
            _ => None,
        }
    }

    /// Drop open connections whose channel no longer reports open.
    pub fn sweep_stale(&mut self) -> Vec<Connection> {
        let stale: Vec<PeerId> = self
            .connections
            .values()
            .filter(|c| c.is_open() && !c.is_channel_open())
            .map(|c| c.id.clone())
            .collect();

        stale.iter().filter_map(|peer| self.remove(peer)).collect()
    }

    pub fn get(&self, peer: &PeerId) -> Option<&Connection> {
        self.connections.get(peer)
    }

    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut Connection> {
        self.connections.get_mut(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.connections.contains_key(peer)
    }

    pub fn is_attempting(&self, peer: &PeerId) -> bool {
        self.connections
            .get(peer)
            .is_some_and(|c| c.state == ConnectionState::Attempting)
    }

    /// Open connections in rank order.
    pub fn open_connections(&self) -> impl Iterator<Item = &Connection> {
        self.order
            .ranked()
            .iter()
            .filter_map(|peer| self.connections.get(peer))
    }

    /// Open peer ids in rank order.
    pub fn open_ids(&self) -> Vec<PeerId> {
        self.order.ranked().to_vec()
    }

    pub fn attempting_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .connections
            .values()
            .filter(|c| c.state == ConnectionState::Attempting)
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// All registered peer ids, any state.
    pub fn all_ids(&self) -> Vec<PeerId> {
        self.connections.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn order(&self) -> &PeerOrder {
        &self.order
    }

    pub fn my_position(&self) -> usize {
        self.order.my_position()
    }

    fn recompute_order(&mut self) {
        let open: Vec<&PeerId> = self
            .connections
            .values()
            .filter(|c| c.state == ConnectionState::Open)
            .map(|c| &c.id)
            .collect();
        self.order.recompute(&self.me, open);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::entities::PeerInfo;
    use crate::domain::ports::ChannelKind;
    use crate::domain::value_objects::lexical;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    /// Channel double recording what was sent.
    pub(crate) struct StubChannel {
        id: ChannelId,
        peer: PeerId,
        open: AtomicBool,
        pub sent: Mutex<Vec<Envelope>>,
    }

    impl StubChannel {
        pub(crate) fn new(peer: &str) -> Arc<Self> {
            Arc::new(Self {
                id: ChannelId::next(),
                peer: PeerId::new(peer),
                open: AtomicBool::new(true),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    impl TransportChannel for StubChannel {
        fn id(&self) -> ChannelId {
            self.id
        }
        fn peer_id(&self) -> &PeerId {
            &self.peer
        }
        fn kind(&self) -> ChannelKind {
            ChannelKind::Direct
        }
        fn send(&self, envelope: &Envelope) -> Result<(), ChannelError> {
            self.sent.lock().push(envelope.clone());
            Ok(())
        }
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
        fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    /// Transport double handing out stub channels.
    pub(crate) struct StubTransport {
        pub created: Mutex<Vec<Arc<StubChannel>>>,
    }

    impl StubTransport {
        pub(crate) fn new() -> Self {
            Self {
                created: Mutex::new(Vec::new()),
            }
        }
    }

    impl Transport for StubTransport {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Direct
        }
        fn can_reach(&self, _peer: &PeerId) -> bool {
            true
        }
        fn learn(&self, _peer: &PeerInfo) {}
        fn connect(
            &self,
            _local: &PeerId,
            remote: &PeerId,
            _sink: InboundSink,
        ) -> Result<Arc<dyn TransportChannel>, TransportError> {
            let channel = StubChannel::new(remote.as_str());
            self.created.lock().push(channel.clone());
            Ok(channel)
        }
    }

    fn registry(me: &str) -> ConnectionRegistry {
        ConnectionRegistry::new(PeerId::new(me), lexical)
    }

    fn sink() -> InboundSink {
        mpsc::unbounded_channel().0
    }

    #[test]
    fn test_connect_twice_creates_one_connection() {
        let mut reg = registry("me");
        let transport = StubTransport::new();
        let peer = PeerId::new("other");

        assert!(reg.connect_to(&peer, &transport, sink()).unwrap());
        assert!(!reg.connect_to(&peer, &transport, sink()).unwrap());

        assert_eq!(reg.len(), 1);
        assert_eq!(transport.created.lock().len(), 1);
        assert!(reg.is_attempting(&peer));
    }

    #[test]
    fn test_connect_to_self_is_noop() {
        let mut reg = registry("me");
        let transport = StubTransport::new();
        assert!(!reg.connect_to(&PeerId::new("me"), &transport, sink()).unwrap());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_mark_open_once() {
        let mut reg = registry("m");
        let channel = StubChannel::new("a");
        let id = channel.id();
        reg.accept_incoming(channel);

        assert!(reg.mark_open(&PeerId::new("a"), id));
        assert!(!reg.mark_open(&PeerId::new("a"), id));
        assert_eq!(reg.open_ids(), vec![PeerId::new("a")]);
        assert_eq!(reg.my_position(), 1);
    }

    #[test]
    fn test_accepting_side_owes_initial_sync() {
        let mut reg = registry("m");
        let transport = StubTransport::new();

        reg.connect_to(&PeerId::new("out"), &transport, sink()).unwrap();
        let out_id = reg.get(&PeerId::new("out")).unwrap().channel_id();
        reg.mark_open(&PeerId::new("out"), out_id);

        let incoming = StubChannel::new("in");
        let in_id = incoming.id();
        reg.accept_incoming(incoming);
        reg.mark_open(&PeerId::new("in"), in_id);

        assert!(!reg.get(&PeerId::new("out")).unwrap().pending_initial_sync);
        assert!(reg.get(&PeerId::new("in")).unwrap().pending_initial_sync);
    }

    #[test]
    fn test_mark_open_ignores_foreign_channel() {
        let mut reg = registry("m");
        reg.accept_incoming(StubChannel::new("a"));
        assert!(!reg.mark_open(&PeerId::new("a"), ChannelId::next()));
        assert!(reg.open_ids().is_empty());
    }

    #[test]
    fn test_remove_recomputes_order() {
        let mut reg = registry("b");
        for peer in ["a", "c"] {
            let channel = StubChannel::new(peer);
            let id = channel.id();
            reg.accept_incoming(channel);
            reg.mark_open(&PeerId::new(peer), id);
        }
        assert_eq!(reg.my_position(), 1);

        let removed = reg.remove(&PeerId::new("a")).unwrap();
        assert_eq!(removed.state, ConnectionState::Closed);
        assert_eq!(reg.my_position(), 0);
        assert_eq!(reg.open_ids(), vec![PeerId::new("c")]);
    }

    #[test]
    fn test_sweep_stale_removes_closed_channels() {
        let mut reg = registry("m");
        let alive = StubChannel::new("alive");
        let dead = StubChannel::new("dead");
        let (alive_id, dead_id) = (alive.id(), dead.id());
        reg.accept_incoming(alive);
        reg.accept_incoming(dead.clone());
        reg.mark_open(&PeerId::new("alive"), alive_id);
        reg.mark_open(&PeerId::new("dead"), dead_id);

        dead.close();
        let removed = reg.sweep_stale();

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, PeerId::new("dead"));
        assert!(reg.contains(&PeerId::new("alive")));
    }

    #[test]
    fn test_duplicate_incoming_rejected_when_open() {
        let mut reg = registry("m");
        let first = StubChannel::new("a");
        let first_id = first.id();
        reg.accept_incoming(first);
        reg.mark_open(&PeerId::new("a"), first_id);

        let second = StubChannel::new("a");
        assert!(matches!(reg.accept_incoming(second.clone()), AcceptOutcome::Rejected));
        assert!(!second.is_open());
        assert_eq!(reg.get(&PeerId::new("a")).unwrap().channel_id(), first_id);
    }

    #[test]
    fn test_simultaneous_connect_lower_id_wins() {
        // we are "m"; remote "a" ranks lower, so its dial survives
        let mut reg = registry("m");
        let transport = StubTransport::new();
        reg.connect_to(&PeerId::new("a"), &transport, sink()).unwrap();
        let ours = transport.created.lock()[0].clone();

        let theirs = StubChannel::new("a");
        match reg.accept_incoming(theirs.clone()) {
            AcceptOutcome::Replaced(displaced) => assert_eq!(displaced.state, ConnectionState::Closed),
            other => panic!("expected replacement, got {:?}", other),
        }
        assert!(!ours.is_open());
        assert_eq!(reg.get(&PeerId::new("a")).unwrap().channel_id(), theirs.id());

        // remote "z" ranks higher, so our own dial survives
        reg.connect_to(&PeerId::new("z"), &transport, sink()).unwrap();
        let theirs = StubChannel::new("z");
        assert!(matches!(reg.accept_incoming(theirs.clone()), AcceptOutcome::Rejected));
        assert!(!theirs.is_open());
    }

    #[test]
    fn test_dead_open_connection_gives_way() {
        let mut reg = registry("a");
        let first = StubChannel::new("z");
        let first_id = first.id();
        reg.accept_incoming(first.clone());
        reg.mark_open(&PeerId::new("z"), first_id);
        first.close();

        let second = StubChannel::new("z");
        assert!(matches!(reg.accept_incoming(second.clone()), AcceptOutcome::Replaced(_)));
        assert!(reg.is_attempting(&PeerId::new("z")));
        assert!(reg.open_ids().is_empty());
    }

    #[test]
    fn test_remove_channel_checks_identity() {
        let mut reg = registry("m");
        let channel = StubChannel::new("a");
        let id = channel.id();
        reg.accept_incoming(channel);

        assert!(reg.remove_channel(&PeerId::new("a"), ChannelId::next()).is_none());
        assert!(reg.remove_channel(&PeerId::new("a"), id).is_some());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_send_on_closed_channel_fails() {
        let mut reg = registry("m");
        let channel = StubChannel::new("a");
        reg.accept_incoming(channel.clone());
        channel.close();

        let conn = reg.get(&PeerId::new("a")).unwrap();
        assert!(matches!(
            conn.send(&Envelope::new("data", serde_json::Value::Null)),
            Err(ChannelError::Closed(_))
        ));
    }
}
