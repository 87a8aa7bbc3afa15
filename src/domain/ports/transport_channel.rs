//! Transport Channel Port
//!
//! Defines the interface for one ordered, reliable, bidirectional message
//! channel to exactly one remote peer, and for the transports that open them.

use crate::domain::entities::{PeerId, PeerInfo};
use crate::domain::ports::relay_client::RelayEvent;
use crate::domain::value_objects::{ChannelId, Envelope};
use std::sync::Arc;
use tokio::sync::mpsc;

/// How a channel is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Point-to-point link between the two peers
    Direct,
    /// Simulated link forwarded through the relay service
    Relayed,
}

/// Lifecycle and data events emitted by a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEventKind {
    Opened,
    Data(Envelope),
    Closed,
    Error(String),
}

/// An event tagged with the channel it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub peer: PeerId,
    pub channel: ChannelId,
    pub kind: ChannelEventKind,
}

impl ChannelEvent {
    pub fn new(peer: PeerId, channel: ChannelId, kind: ChannelEventKind) -> Self {
        Self { peer, channel, kind }
    }
}

/// Everything the session reacts to, delivered on a single queue.
#[derive(Clone)]
pub enum Inbound {
    /// Event on an already registered channel
    Channel(ChannelEvent),
    /// Event from the relay service
    Relay(RelayEvent),
    /// A remote peer opened a channel to us
    Incoming(Arc<dyn TransportChannel>),
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel(event) => f.debug_tuple("Channel").field(event).finish(),
            Self::Relay(event) => f.debug_tuple("Relay").field(event).finish(),
            Self::Incoming(channel) => f
                .debug_tuple("Incoming")
                .field(&channel.peer_id())
                .field(&channel.kind())
                .finish(),
        }
    }
}

/// Sender half of the session's inbound queue.
pub type InboundSink = mpsc::UnboundedSender<Inbound>;

/// Errors raised when sending on a channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel to {0} is not open")]
    Closed(PeerId),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("channel i/o failed: {0}")]
    Io(String),
}

/// Errors raised by transports and the relay.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is not registered with the transport")]
    PeerUnavailable(PeerId),
    #[error("relay is not reachable")]
    RelayUnavailable,
    #[error("transport i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// One channel to one remote peer.
///
/// Implementations deliver their events through the [`InboundSink`] they
/// were created with; `send` never blocks.
pub trait TransportChannel: Send + Sync {
    /// Identifier of this channel instance.
    fn id(&self) -> ChannelId;

    /// The remote peer.
    fn peer_id(&self) -> &PeerId;

    fn kind(&self) -> ChannelKind;

    /// Queue a message for delivery.
    fn send(&self, envelope: &Envelope) -> Result<(), ChannelError>;

    fn is_open(&self) -> bool;

    /// Close the channel. Idempotent.
    fn close(&self);
}

/// Factory for outgoing channels of one kind.
pub trait Transport: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Whether this transport knows how to reach `peer`.
    fn can_reach(&self, peer: &PeerId) -> bool;

    /// Record what the relay reported about a peer (e.g. its address).
    fn learn(&self, _peer: &PeerInfo) {}

    /// Start connecting. Returns immediately; the outcome arrives later as
    /// `Opened` or `Error`/`Closed` events on `sink`.
    fn connect(
        &self,
        local: &PeerId,
        remote: &PeerId,
        sink: InboundSink,
    ) -> Result<Arc<dyn TransportChannel>, TransportError>;
}
