//! Value Objects - Immutable session primitives
//!
//! Value objects are identified by their value rather than identity.

use crate::domain::entities::PeerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Wire envelope carried by every channel message.
///
/// `{ type, data, id?, isDelta? }` encoded as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, rename = "isDelta", skip_serializing_if = "Option::is_none")]
    pub is_delta: Option<bool>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            id: None,
            is_delta: None,
        }
    }
}

/// Handler invoked with `(data_id, data, origin_peer)` when a sync message
/// is received instead of the default merge.
pub type SyncHandler = Arc<dyn Fn(&str, &Value, &PeerId) + Send + Sync>;

/// One entry of a role configuration: the data id the role wants, with an
/// optional handler that takes over from the default merge.
#[derive(Clone)]
pub struct RoleSubscription {
    pub data_id: String,
    pub handler: Option<SyncHandler>,
}

impl RoleSubscription {
    pub fn id(data_id: impl Into<String>) -> Self {
        Self {
            data_id: data_id.into(),
            handler: None,
        }
    }

    pub fn with_handler(data_id: impl Into<String>, handler: SyncHandler) -> Self {
        Self {
            data_id: data_id.into(),
            handler: Some(handler),
        }
    }
}

impl From<&str> for RoleSubscription {
    fn from(s: &str) -> Self {
        Self::id(s)
    }
}

impl std::fmt::Debug for RoleSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleSubscription")
            .field("data_id", &self.data_id)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Attempting,
    Open,
    Closed,
}

/// Process-unique identifier of a transport channel.
///
/// Lets the registry ignore late events from a channel it already replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl ChannelId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Comparator used to rank peers. Must depend on the ids only.
pub type PeerComparator = fn(&PeerId, &PeerId) -> Ordering;

/// Plain lexicographic comparison of ids.
pub fn lexical(a: &PeerId, b: &PeerId) -> Ordering {
    a.0.cmp(&b.0)
}

/// Numeric comparison when both ids are integers, lexicographic otherwise.
///
/// Numeric ids sort before non-numeric ones so the order stays total.
pub fn numeric_aware(a: &PeerId, b: &PeerId) -> Ordering {
    match (a.0.parse::<u128>(), b.0.parse::<u128>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.0.cmp(&b.0)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.0.cmp(&b.0),
    }
}

/// Deterministic ranking of the connected peers plus self.
///
/// Every peer holding the same connected set computes the same ranking,
/// which lets hosts pick leaders or layout positions without a round trip.
#[derive(Debug, Clone)]
pub struct PeerOrder {
    comparator: PeerComparator,
    ranked: Vec<PeerId>,
    my_position: usize,
}

impl Default for PeerOrder {
    fn default() -> Self {
        Self::new(lexical)
    }
}

impl PeerOrder {
    pub fn new(comparator: PeerComparator) -> Self {
        Self {
            comparator,
            ranked: Vec::new(),
            my_position: 0,
        }
    }

    /// Recompute the ranking for a new connected set.
    pub fn recompute<'a>(&mut self, me: &PeerId, connected: impl IntoIterator<Item = &'a PeerId>) {
        let cmp = self.comparator;
        let mut ranked: Vec<PeerId> = connected.into_iter().filter(|p| *p != me).cloned().collect();
        ranked.sort_by(cmp);
        ranked.dedup();
        self.my_position = ranked
            .iter()
            .position(|p| cmp(me, p) == Ordering::Less)
            .unwrap_or(ranked.len());
        self.ranked = ranked;
    }

    /// Connected peers in rank order, self excluded.
    pub fn ranked(&self) -> &[PeerId] {
        &self.ranked
    }

    /// Index of self in the full order.
    pub fn my_position(&self) -> usize {
        self.my_position
    }

    /// The full order including self.
    pub fn full_order(&self, me: &PeerId) -> Vec<PeerId> {
        let mut order = self.ranked.clone();
        order.insert(self.my_position, me.clone());
        order
    }

    pub fn comparator(&self) -> PeerComparator {
        self.comparator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<PeerId> {
        raw.iter().map(|s| PeerId::new(*s)).collect()
    }

    #[test]
    fn test_envelope_wire_names() {
        let mut env = Envelope::new("sync", serde_json::json!([1, 2]));
        env.id = Some("list".to_string());
        env.is_delta = Some(true);

        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "sync");
        assert_eq!(value["id"], "list");
        assert_eq!(value["isDelta"], true);
    }

    #[test]
    fn test_envelope_omits_absent_fields() {
        let env = Envelope::new("roles", serde_json::json!(["a"]));
        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains("isDelta"));
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn test_peer_order_position() {
        let mut order = PeerOrder::default();
        let connected = ids(&["c", "a", "e"]);
        order.recompute(&PeerId::new("d"), &connected);

        assert_eq!(order.ranked(), ids(&["a", "c", "e"]).as_slice());
        assert_eq!(order.my_position(), 2);
        assert_eq!(order.full_order(&PeerId::new("d")), ids(&["a", "c", "d", "e"]));
    }

    #[test]
    fn test_peer_order_self_last() {
        let mut order = PeerOrder::default();
        order.recompute(&PeerId::new("z"), &ids(&["a", "b"]));
        assert_eq!(order.my_position(), 2);
    }

    #[test]
    fn test_peer_order_empty() {
        let mut order = PeerOrder::default();
        order.recompute(&PeerId::new("a"), &Vec::new());
        assert_eq!(order.my_position(), 0);
        assert!(order.ranked().is_empty());
    }

    #[test]
    fn test_peer_order_identical_across_peers() {
        let everyone = ids(&["p3", "p1", "p4", "p2"]);

        let orders: Vec<Vec<PeerId>> = everyone
            .iter()
            .map(|me| {
                let mut order = PeerOrder::default();
                order.recompute(me, &everyone);
                order.full_order(me)
            })
            .collect();

        for order in &orders {
            assert_eq!(order, &orders[0]);
        }
        assert_eq!(orders[0], ids(&["p1", "p2", "p3", "p4"]));
    }

    #[test]
    fn test_numeric_aware_comparator() {
        let mut order = PeerOrder::new(numeric_aware);
        order.recompute(&PeerId::new("10"), &ids(&["9", "100", "abc"]));
        assert_eq!(order.full_order(&PeerId::new("10")), ids(&["9", "10", "100", "abc"]));
    }

    #[test]
    fn test_channel_ids_increase() {
        let a = ChannelId::next();
        let b = ChannelId::next();
        assert!(b > a);
    }

    #[test]
    fn test_role_subscription_debug_hides_handler() {
        let handler: SyncHandler = Arc::new(|_: &str, _: &Value, _: &PeerId| {});
        let sub = RoleSubscription::with_handler("photos", handler);
        let debug = format!("{:?}", sub);
        assert!(debug.contains("photos"));
        assert!(debug.contains("handler: true"));
    }
}
