//! In-Memory Relay
//!
//! Implements RelayClient as an in-process rendezvous hub using DashMap.
//! Every identified peer gets its relay events on its own inbound queue.

use crate::domain::entities::{DeviceInfo, PeerId, PeerInfo};
use crate::domain::ports::{
    Announcement, Inbound, InboundSink, RelayClient, RelayEvent, TransportError, WrappedMessage,
};
use crate::domain::value_objects::Envelope;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

struct Registration {
    info: PeerInfo,
    sink: InboundSink,
}

/// What a peer has announced, kept for late joiners.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerAnnouncements {
    pub device: Option<DeviceInfo>,
    pub roles: Vec<String>,
    pub role_configs: BTreeMap<String, Vec<String>>,
    /// Last mirrored sync message per data id, with its recipients
    pub syncs: BTreeMap<String, (Envelope, Vec<PeerId>)>,
}

/// DashMap-backed rendezvous hub.
pub struct InMemoryRelay {
    peers: Arc<DashMap<PeerId, Registration>>,
    announcements: Arc<DashMap<PeerId, PeerAnnouncements>>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            announcements: Arc::new(DashMap::new()),
        }
    }

    pub fn is_registered(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Announcements recorded for `peer`.
    pub fn announcements(&self, peer: &PeerId) -> Option<PeerAnnouncements> {
        self.announcements.get(peer).map(|e| e.value().clone())
    }

    fn deliver(&self, peer: &PeerId, event: RelayEvent) -> Result<(), TransportError> {
        let sink = self
            .peers
            .get(peer)
            .map(|r| r.sink.clone())
            .ok_or_else(|| TransportError::PeerUnavailable(peer.clone()))?;

        if sink.send(Inbound::Relay(event)).is_err() {
            tracing::debug!("relay dropping {}: inbound queue closed", peer);
            self.peers.remove(peer);
            return Err(TransportError::PeerUnavailable(peer.clone()));
        }
        Ok(())
    }
}

impl Default for InMemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayClient for InMemoryRelay {
    fn identify(&self, peer: PeerInfo, sink: InboundSink) -> Result<(), TransportError> {
        tracing::info!("peer {} registered with relay", peer.id);
        self.peers
            .insert(peer.id.clone(), Registration { info: peer, sink });
        Ok(())
    }

    fn disconnect(&self, peer: &PeerId) {
        if self.peers.remove(peer).is_some() {
            tracing::info!("peer {} left relay", peer);
        }
        self.announcements.remove(peer);
    }

    fn request_connect(&self, receiver: &PeerId, sender: &PeerId) -> Result<(), TransportError> {
        if !self.peers.contains_key(sender) {
            return Err(TransportError::RelayUnavailable);
        }
        match self.deliver(
            receiver,
            RelayEvent::ConnectRequest {
                sender: sender.clone(),
            },
        ) {
            Ok(()) => Ok(()),
            Err(TransportError::PeerUnavailable(_)) => {
                self.deliver(sender, RelayEvent::PeerUnavailable(receiver.clone()))
            }
            Err(e) => Err(e),
        }
    }

    fn forward(&self, message: WrappedMessage) -> Result<(), TransportError> {
        self.deliver(
            &message.receiver,
            RelayEvent::Wrapped {
                sender: message.sender,
                event_tag: message.event_tag,
                payload: message.payload,
            },
        )
    }

    fn announce(&self, sender: &PeerId, announcement: Announcement) -> Result<(), TransportError> {
        tracing::debug!("relay {} announcement from {}", announcement.kind(), sender);
        let mut record = self.announcements.entry(sender.clone()).or_default();
        match announcement {
            Announcement::Device(device) => {
                if let Some(mut reg) = self.peers.get_mut(sender) {
                    reg.info.name = Some(device.name.clone());
                    reg.info.device_type = Some(device.device_type);
                }
                record.device = Some(device);
            }
            Announcement::Roles(roles) => record.roles = roles,
            Announcement::RoleConfigs(configs) => record.role_configs = configs,
            Announcement::Sync { envelope, interested } => {
                let id = envelope.id.clone().unwrap_or_default();
                record.syncs.insert(id, (envelope, interested));
            }
        }
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<PeerInfo>, TransportError> {
        let mut peers: Vec<PeerInfo> = self.peers.iter().map(|e| e.value().info.clone()).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::DeviceType;
    use crate::domain::ports::EventTag;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn register(relay: &InMemoryRelay, id: &str) -> mpsc::UnboundedReceiver<Inbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        relay.identify(PeerInfo::new(PeerId::new(id)), tx).unwrap();
        rx
    }

    fn next_relay_event(rx: &mut mpsc::UnboundedReceiver<Inbound>) -> RelayEvent {
        match rx.try_recv() {
            Ok(Inbound::Relay(event)) => event,
            other => panic!("expected relay event, got {:?}", other),
        }
    }

    #[test]
    fn test_connect_request_reaches_receiver() {
        let relay = InMemoryRelay::new();
        let _a = register(&relay, "a");
        let mut b = register(&relay, "b");

        relay.request_connect(&PeerId::new("b"), &PeerId::new("a")).unwrap();

        assert_eq!(
            next_relay_event(&mut b),
            RelayEvent::ConnectRequest {
                sender: PeerId::new("a")
            }
        );
    }

    #[test]
    fn test_connect_to_unknown_peer_notifies_sender() {
        let relay = InMemoryRelay::new();
        let mut a = register(&relay, "a");

        relay.request_connect(&PeerId::new("ghost"), &PeerId::new("a")).unwrap();

        assert_eq!(next_relay_event(&mut a), RelayEvent::PeerUnavailable(PeerId::new("ghost")));
    }

    #[test]
    fn test_unidentified_sender_rejected() {
        let relay = InMemoryRelay::new();
        let _b = register(&relay, "b");
        assert!(matches!(
            relay.request_connect(&PeerId::new("b"), &PeerId::new("nobody")),
            Err(TransportError::RelayUnavailable)
        ));
    }

    #[test]
    fn test_forward_wrapped_message() {
        let relay = InMemoryRelay::new();
        let mut b = register(&relay, "b");

        relay
            .forward(WrappedMessage {
                receiver: PeerId::new("b"),
                sender: PeerId::new("a"),
                event_tag: EventTag::Data,
                payload: json!({"type": "data", "data": 1}),
            })
            .unwrap();

        match next_relay_event(&mut b) {
            RelayEvent::Wrapped {
                sender, event_tag, ..
            } => {
                assert_eq!(sender, PeerId::new("a"));
                assert_eq!(event_tag, EventTag::Data);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_forward_to_dropped_queue_unregisters() {
        let relay = InMemoryRelay::new();
        drop(register(&relay, "b"));

        let result = relay.forward(WrappedMessage {
            receiver: PeerId::new("b"),
            sender: PeerId::new("a"),
            event_tag: EventTag::Open,
            payload: serde_json::Value::Null,
        });

        assert!(matches!(result, Err(TransportError::PeerUnavailable(_))));
        assert!(!relay.is_registered(&PeerId::new("b")));
    }

    #[test]
    fn test_announcements_recorded() {
        let relay = InMemoryRelay::new();
        let _a = register(&relay, "a");
        let a = PeerId::new("a");

        let device = DeviceInfo::new(a.clone(), "tablet", DeviceType::Medium);
        relay.announce(&a, Announcement::Device(device.clone())).unwrap();
        relay
            .announce(&a, Announcement::Roles(vec!["sync-all".to_string()]))
            .unwrap();

        let record = relay.announcements(&a).unwrap();
        assert_eq!(record.device, Some(device));
        assert_eq!(record.roles, vec!["sync-all".to_string()]);

        relay.disconnect(&a);
        assert!(relay.announcements(&a).is_none());
    }

    #[tokio::test]
    async fn test_list_peers_reflects_device() {
        let relay = InMemoryRelay::new();
        let _b = register(&relay, "b");
        let _a = register(&relay, "a");
        let a = PeerId::new("a");
        relay
            .announce(&a, Announcement::Device(DeviceInfo::new(a.clone(), "phone", DeviceType::Small)))
            .unwrap();

        let peers = tokio_test::assert_ok!(relay.list_peers().await);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].id, a);
        assert_eq!(peers[0].name.as_deref(), Some("phone"));
        assert_eq!(peers[0].device_type, Some(DeviceType::Small));
    }
}
