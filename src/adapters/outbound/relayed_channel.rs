//! Relayed Channel
//!
//! A TransportChannel simulated over the relay: every send becomes a
//! wrapped `data` message, lifecycle changes travel as `open`/`close` tags.

use crate::domain::entities::PeerId;
use crate::domain::ports::{
    ChannelError, ChannelEvent, ChannelEventKind, ChannelKind, EventTag, InboundSink, RelayClient, Transport,
    TransportChannel, TransportError, WrappedMessage,
};
use crate::domain::value_objects::{ChannelId, Envelope};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Channel to one peer through the relay.
pub struct RelayedChannel {
    id: ChannelId,
    local: PeerId,
    peer: PeerId,
    relay: Arc<dyn RelayClient>,
    open: AtomicBool,
    closed: AtomicBool,
}

impl RelayedChannel {
    fn new(local: PeerId, peer: PeerId, relay: Arc<dyn RelayClient>) -> Self {
        Self {
            id: ChannelId::next(),
            local,
            peer,
            relay,
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn mark_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.open.swap(true, Ordering::SeqCst)
    }

    /// Closed by the remote side; nothing is sent back.
    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn signal(&self, event_tag: EventTag, payload: Value) -> Result<(), TransportError> {
        self.relay.forward(WrappedMessage {
            receiver: self.peer.clone(),
            sender: self.local.clone(),
            event_tag,
            payload,
        })
    }
}

impl TransportChannel for RelayedChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn peer_id(&self) -> &PeerId {
        &self.peer
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Relayed
    }

    fn send(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed(self.peer.clone()));
        }
        let payload = serde_json::to_value(envelope)?;
        self.signal(EventTag::Data, payload).map_err(|e| {
            self.open.store(false, Ordering::SeqCst);
            ChannelError::Io(e.to_string())
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        if let Err(e) = self.signal(EventTag::Close, Value::Null) {
            tracing::debug!("close to {} not delivered: {}", self.peer, e);
        }
    }
}

/// Opens relayed channels and turns wrapped relay traffic into channel events.
pub struct RelayTransport {
    relay: Arc<dyn RelayClient>,
    channels: DashMap<PeerId, Arc<RelayedChannel>>,
}

impl RelayTransport {
    pub fn new(relay: Arc<dyn RelayClient>) -> Self {
        Self {
            relay,
            channels: DashMap::new(),
        }
    }

    pub fn relay(&self) -> &Arc<dyn RelayClient> {
        &self.relay
    }

    /// Answer a connect request from `sender`: the channel is open at once
    /// and the sender is told with an `open` tag.
    ///
    /// A pending channel of our own to `sender` is reused, so two peers
    /// dialing each other end up on the same logical channel. An open one
    /// is not: a sender that dials again has lost its end, so the old
    /// channel is closed without telling it and a fresh one takes its place.
    pub fn accept(&self, local: &PeerId, sender: &PeerId) -> Arc<RelayedChannel> {
        let existing = self.channels.get(sender).map(|c| c.clone());
        let channel = match existing {
            Some(pending) if !pending.is_closed() && !pending.is_open() => pending,
            previous => {
                if let Some(stale) = previous.filter(|c| c.is_open()) {
                    tracing::info!("{} dialed again, replacing relayed channel {}", sender, stale.id);
                    stale.mark_closed();
                }
                let channel = Arc::new(RelayedChannel::new(local.clone(), sender.clone(), self.relay.clone()));
                self.channels.insert(sender.clone(), channel.clone());
                channel
            }
        };

        channel.mark_open();
        if let Err(e) = channel.signal(EventTag::Open, Value::Null) {
            tracing::warn!("failed to confirm relayed channel to {}: {}", sender, e);
        }
        channel
    }

    /// Interpret a wrapped message from `sender`.
    pub fn translate(&self, sender: &PeerId, event_tag: EventTag, payload: Value) -> Option<ChannelEvent> {
        let Some(channel) = self.channels.get(sender).map(|c| c.clone()) else {
            tracing::debug!("dropping relayed {:?} from {}: no channel", event_tag, sender);
            return None;
        };

        let kind = match event_tag {
            EventTag::Data => match serde_json::from_value::<Envelope>(payload) {
                Ok(envelope) => ChannelEventKind::Data(envelope),
                Err(e) => {
                    tracing::warn!("dropping malformed relayed message from {}: {}", sender, e);
                    return None;
                }
            },
            EventTag::Open => {
                if !channel.mark_open() {
                    return None;
                }
                ChannelEventKind::Opened
            }
            EventTag::Close => {
                channel.mark_closed();
                self.channels.remove_if(sender, |_, c| c.id == channel.id);
                ChannelEventKind::Closed
            }
            EventTag::Error => {
                let reason = payload
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| payload.to_string());
                ChannelEventKind::Error(reason)
            }
        };
        Some(ChannelEvent::new(sender.clone(), channel.id, kind))
    }

    /// Drop the bookkeeping for a channel that left the registry.
    pub fn forget(&self, peer: &PeerId, channel: ChannelId) {
        self.channels.remove_if(peer, |_, c| c.id == channel);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Transport for RelayTransport {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Relayed
    }

    fn can_reach(&self, _peer: &PeerId) -> bool {
        true
    }

    fn connect(
        &self,
        local: &PeerId,
        remote: &PeerId,
        _sink: InboundSink,
    ) -> Result<Arc<dyn TransportChannel>, TransportError> {
        let channel = Arc::new(RelayedChannel::new(local.clone(), remote.clone(), self.relay.clone()));
        if let Some(previous) = self.channels.insert(remote.clone(), channel.clone()) {
            previous.mark_closed();
        }
        self.relay.request_connect(remote, local)?;
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::InMemoryRelay;
    use crate::domain::entities::PeerInfo;
    use crate::domain::ports::{Inbound, RelayEvent};
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Side {
        id: PeerId,
        transport: RelayTransport,
        rx: mpsc::UnboundedReceiver<Inbound>,
        tx: InboundSink,
    }

    fn side(relay: &Arc<InMemoryRelay>, id: &str) -> Side {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = PeerId::new(id);
        relay.identify(PeerInfo::new(id.clone()), tx.clone()).unwrap();
        let client: Arc<dyn RelayClient> = relay.clone();
        Side {
            id,
            transport: RelayTransport::new(client),
            rx,
            tx,
        }
    }

    fn next(side: &mut Side) -> RelayEvent {
        match side.rx.try_recv() {
            Ok(Inbound::Relay(event)) => event,
            other => panic!("expected relay event, got {:?}", other),
        }
    }

    fn translate(side: &Side, event: RelayEvent) -> Option<ChannelEvent> {
        match event {
            RelayEvent::Wrapped {
                sender,
                event_tag,
                payload,
            } => side.transport.translate(&sender, event_tag, payload),
            other => panic!("expected wrapped event, got {:?}", other),
        }
    }

    #[test]
    fn test_handshake_and_data() {
        let relay = Arc::new(InMemoryRelay::new());
        let mut a = side(&relay, "a");
        let mut b = side(&relay, "b");

        let dialed = a.transport.connect(&a.id, &b.id, a.tx.clone()).unwrap();
        assert!(!dialed.is_open());

        assert_eq!(next(&mut b), RelayEvent::ConnectRequest { sender: a.id.clone() });
        let accepted = b.transport.accept(&b.id, &a.id);
        assert!(accepted.is_open());

        let event = next(&mut a);
        let opened = translate(&a, event).unwrap();
        assert_eq!(opened.kind, ChannelEventKind::Opened);
        assert_eq!(opened.channel, dialed.id());
        assert!(dialed.is_open());

        dialed.send(&Envelope::new("data", json!({"hello": 1}))).unwrap();
        let event = next(&mut b);
        let data = translate(&b, event).unwrap();
        assert_eq!(data.kind, ChannelEventKind::Data(Envelope::new("data", json!({"hello": 1}))));
        assert_eq!(data.channel, accepted.id());
    }

    #[test]
    fn test_send_before_open_fails() {
        let relay = Arc::new(InMemoryRelay::new());
        let a = side(&relay, "a");
        let _b = side(&relay, "b");

        let dialed = a.transport.connect(&a.id, &PeerId::new("b"), a.tx.clone()).unwrap();
        assert!(matches!(
            dialed.send(&Envelope::new("data", Value::Null)),
            Err(ChannelError::Closed(_))
        ));
    }

    #[test]
    fn test_close_reaches_remote() {
        let relay = Arc::new(InMemoryRelay::new());
        let mut a = side(&relay, "a");
        let mut b = side(&relay, "b");

        a.transport.connect(&a.id, &b.id, a.tx.clone()).unwrap();
        next(&mut b);
        let accepted = b.transport.accept(&b.id, &a.id);
        let event = next(&mut a);
        translate(&a, event);

        accepted.close();
        accepted.close();
        assert!(!accepted.is_open());

        let event = next(&mut a);
        let closed = translate(&a, event).unwrap();
        assert_eq!(closed.kind, ChannelEventKind::Closed);
        assert_eq!(a.transport.channel_count(), 0);
        assert!(a.rx.try_recv().is_err());
    }

    #[test]
    fn test_simultaneous_accept_reuses_channel() {
        let relay = Arc::new(InMemoryRelay::new());
        let a = side(&relay, "a");
        let _b = side(&relay, "b");

        let dialed = a.transport.connect(&a.id, &PeerId::new("b"), a.tx.clone()).unwrap();
        let accepted = a.transport.accept(&a.id, &PeerId::new("b"));

        assert_eq!(accepted.id(), dialed.id());
        assert!(dialed.is_open());
    }

    #[test]
    fn test_redial_replaces_open_channel() {
        let relay = Arc::new(InMemoryRelay::new());
        let mut a = side(&relay, "a");
        let mut b = side(&relay, "b");

        a.transport.connect(&a.id, &b.id, a.tx.clone()).unwrap();
        next(&mut b);
        let first = b.transport.accept(&b.id, &a.id);
        let event = next(&mut a);
        translate(&a, event);

        // `a` restarted and dials again
        let mut restarted = side(&relay, "a");
        restarted.transport.connect(&restarted.id, &b.id, restarted.tx.clone()).unwrap();
        next(&mut b);
        let second = b.transport.accept(&b.id, &a.id);

        assert_ne!(second.id(), first.id());
        assert!(second.is_open());
        assert!(!first.is_open());
        assert_eq!(b.transport.channel_count(), 1);

        let event = next(&mut restarted);
        assert_eq!(translate(&restarted, event).unwrap().kind, ChannelEventKind::Opened);

        // the replaced channel stays silent
        first.close();
        assert!(restarted.rx.try_recv().is_err());
    }

    #[test]
    fn test_unknown_sender_dropped() {
        let relay = Arc::new(InMemoryRelay::new());
        let a = side(&relay, "a");
        assert!(a
            .transport
            .translate(&PeerId::new("stranger"), EventTag::Data, json!({"type": "data"}))
            .is_none());
    }

    #[test]
    fn test_forget_checks_channel() {
        let relay = Arc::new(InMemoryRelay::new());
        let a = side(&relay, "a");
        let _b = side(&relay, "b");
        let dialed = a.transport.connect(&a.id, &PeerId::new("b"), a.tx.clone()).unwrap();

        a.transport.forget(&PeerId::new("b"), ChannelId::next());
        assert_eq!(a.transport.channel_count(), 1);
        a.transport.forget(&PeerId::new("b"), dialed.id());
        assert_eq!(a.transport.channel_count(), 0);
    }
}
