//! Session Events
//!
//! Notifications delivered to the host application, with a small
//! subscribe/unsubscribe registry keyed by event kind.

use crate::domain::entities::{DeviceInfo, PeerId};
use serde_json::Value;
use std::collections::BTreeMap;

/// Events emitted by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A connection reached the open state
    Connected(PeerId),
    /// A connection was closed or dropped
    Disconnected(PeerId),
    /// Opaque `data` payload from a peer
    Data { from: PeerId, data: Value },
    /// A peer announced its device
    Device { from: PeerId, device: DeviceInfo },
    /// Aggregate role counts of connected peers changed
    OthersRolesChanged(BTreeMap<String, usize>),
    /// A local change was propagated
    SyncData(String),
    /// A remote update was applied
    RemoteSync { id: String, from: PeerId },
    /// A connection attempt failed because the peer is unknown
    PeerUnavailable(PeerId),
    /// Non-fatal failure
    Error { peer: Option<PeerId>, reason: String },
    /// The list of available devices was refreshed
    AvailableDevices(usize),
}

/// Event kinds for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Connected,
    Disconnected,
    Data,
    Device,
    OthersRolesChanged,
    SyncData,
    RemoteSync,
    PeerUnavailable,
    Error,
    AvailableDevices,
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected(_) => EventKind::Connected,
            Self::Disconnected(_) => EventKind::Disconnected,
            Self::Data { .. } => EventKind::Data,
            Self::Device { .. } => EventKind::Device,
            Self::OthersRolesChanged(_) => EventKind::OthersRolesChanged,
            Self::SyncData(_) => EventKind::SyncData,
            Self::RemoteSync { .. } => EventKind::RemoteSync,
            Self::PeerUnavailable(_) => EventKind::PeerUnavailable,
            Self::Error { .. } => EventKind::Error,
            Self::AvailableDevices(_) => EventKind::AvailableDevices,
        }
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub type EventHandler = Box<dyn FnMut(&SessionEvent) + Send>;

struct Subscription {
    id: SubscriptionId,
    kind: Option<EventKind>,
    handler: EventHandler,
}

/// Dispatches session events to subscribed handlers, in subscription order.
#[derive(Default)]
pub struct EventBus {
    subscriptions: Vec<Subscription>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive events of one kind.
    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&SessionEvent) + Send + 'static,
    {
        self.insert(Some(kind), Box::new(handler))
    }

    /// Receive every event.
    pub fn subscribe_all<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&SessionEvent) + Send + 'static,
    {
        self.insert(None, Box::new(handler))
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        before != self.subscriptions.len()
    }

    pub fn emit(&mut self, event: SessionEvent) {
        let kind = event.kind();
        tracing::trace!("event {:?}", kind);
        for sub in self
            .subscriptions
            .iter_mut()
            .filter(|s| s.kind.is_none() || s.kind == Some(kind))
        {
            (sub.handler)(&event);
        }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    fn insert(&mut self, kind: Option<EventKind>, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscriptions.push(Subscription { id, kind, handler });
        id
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}
