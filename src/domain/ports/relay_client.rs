//! Relay Client Port
//!
//! Defines the interface to the rendezvous/relay service that brokers
//! connections, simulates channels by forwarding tagged events, and keeps
//! track of who is online.

use crate::domain::entities::{DeviceInfo, PeerId, PeerInfo};
use crate::domain::ports::transport_channel::{InboundSink, TransportError};
use crate::domain::value_objects::Envelope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Logical channel event a relayed message stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventTag {
    Data,
    Open,
    Close,
    Error,
}

/// `wrapMsg`: a payload the relay delivers to `receiver` on behalf of `sender`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrappedMessage {
    pub receiver: PeerId,
    pub sender: PeerId,
    #[serde(rename = "eventTag")]
    pub event_tag: EventTag,
    #[serde(default)]
    pub payload: Value,
}

/// Events the relay pushes to an identified peer.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// `connectTo { sender }`: a peer wants to connect to us
    ConnectRequest { sender: PeerId },
    /// A forwarded channel event from `sender`
    Wrapped {
        sender: PeerId,
        event_tag: EventTag,
        payload: Value,
    },
    /// A connect request we issued targeted an unknown peer
    PeerUnavailable(PeerId),
    /// Relay-level failure
    Error(String),
}

/// Declarations pushed to the relay so late joiners can learn them.
#[derive(Debug, Clone, PartialEq)]
pub enum Announcement {
    Device(DeviceInfo),
    Roles(Vec<String>),
    /// `roleConfigs { roles }`: role -> configured data ids
    RoleConfigs(BTreeMap<String, Vec<String>>),
    /// A sync message mirrored to the relay with the peers it was sent to
    Sync {
        envelope: Envelope,
        interested: Vec<PeerId>,
    },
}

impl Announcement {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Device(_) => "device",
            Self::Roles(_) => "roles",
            Self::RoleConfigs(_) => "roleConfigs",
            Self::Sync { .. } => "sync",
        }
    }
}

/// Client side of the relay service.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Register `peer` and route its relay events to `sink`.
    fn identify(&self, peer: PeerInfo, sink: InboundSink) -> Result<(), TransportError>;

    /// Drop the registration of `peer`.
    fn disconnect(&self, peer: &PeerId);

    /// Ask the relay to tell `receiver` that `sender` wants to connect.
    fn request_connect(&self, receiver: &PeerId, sender: &PeerId) -> Result<(), TransportError>;

    /// Forward a tagged channel event.
    fn forward(&self, message: WrappedMessage) -> Result<(), TransportError>;

    fn announce(&self, sender: &PeerId, announcement: Announcement) -> Result<(), TransportError>;

    /// `listAllPeers`: everyone currently registered.
    async fn list_peers(&self) -> Result<Vec<PeerInfo>, TransportError>;
}
