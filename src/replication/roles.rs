//! Role Manager
//!
//! Tracks the roles this peer declares, the data each role is configured to
//! receive, and how many connected peers hold each role.

use crate::domain::value_objects::{RoleSubscription, SyncHandler};
use std::collections::{BTreeMap, BTreeSet};

/// Roles declared here, role configurations, and counts observed on peers.
pub struct RoleManager {
    default_role: String,
    declared: Vec<String>,
    configured: BTreeMap<String, BTreeMap<String, Option<SyncHandler>>>,
    others: BTreeMap<String, usize>,
}

impl RoleManager {
    pub fn new(default_role: impl Into<String>) -> Self {
        Self {
            default_role: default_role.into(),
            declared: Vec::new(),
            configured: BTreeMap::new(),
            others: BTreeMap::new(),
        }
    }

    pub fn default_role(&self) -> &str {
        &self.default_role
    }

    /// Declared roles in declaration order.
    pub fn declared(&self) -> &[String] {
        &self.declared
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.declared.iter().any(|r| r == role)
    }

    /// Add a role. Returns false if it was already declared.
    pub fn declare(&mut self, role: &str) -> bool {
        if self.has_role(role) {
            return false;
        }
        self.declared.push(role.to_string());
        true
    }

    /// Remove a role. Returns false if it was not declared.
    pub fn retract(&mut self, role: &str) -> bool {
        let before = self.declared.len();
        self.declared.retain(|r| r != role);
        before != self.declared.len()
    }

    /// Replace the configuration of `role`. Returns the configured ids.
    ///
    /// A later subscription for the same id overrides an earlier one.
    pub fn configure_role<I, S>(&mut self, role: &str, subscriptions: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<RoleSubscription>,
    {
        let entries: BTreeMap<String, Option<SyncHandler>> = subscriptions
            .into_iter()
            .map(Into::into)
            .map(|sub| (sub.data_id, sub.handler))
            .collect();
        let ids = entries.keys().cloned().collect();
        self.configured.insert(role.to_string(), entries);
        ids
    }

    /// Role -> configured ids, as published to the relay.
    pub fn configured_ids(&self) -> BTreeMap<String, Vec<String>> {
        self.configured
            .iter()
            .map(|(role, entries)| (role.clone(), entries.keys().cloned().collect()))
            .collect()
    }

    /// Ids configured for `role`, if configured at all.
    pub fn configuration(&self, role: &str) -> Option<Vec<String>> {
        self.configured
            .get(role)
            .map(|entries| entries.keys().cloned().collect())
    }

    /// Whether a peer holding `remote_roles` should receive `data_id`.
    ///
    /// Evaluated against the local configuration: the remote declares roles,
    /// this peer decides what they mean.
    pub fn is_interested(&self, remote_roles: &[String], data_id: &str) -> bool {
        remote_roles.iter().any(|role| {
            *role == self.default_role
                || self
                    .configured
                    .get(role)
                    .is_some_and(|entries| entries.contains_key(data_id))
        })
    }

    /// Handlers of every non-default declared role configured for `data_id`,
    /// in declaration order.
    pub fn resolve_callbacks(&self, data_id: &str) -> Vec<SyncHandler> {
        self.declared
            .iter()
            .filter(|role| **role != self.default_role)
            .filter_map(|role| self.configured.get(role))
            .filter_map(|entries| entries.get(data_id).cloned().flatten())
            .collect()
    }

    /// Apply a peer's role change to the aggregate counts.
    ///
    /// Returns true when any count changed. Counts never go below zero.
    pub fn update_role_counts(&mut self, old: &[String], new: &[String]) -> bool {
        let old: BTreeSet<&String> = old.iter().collect();
        let new: BTreeSet<&String> = new.iter().collect();
        let mut changed = false;

        for role in old.difference(&new) {
            if let Some(count) = self.others.get_mut(*role) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.others.remove(*role);
                }
                changed = true;
            }
        }
        for role in new.difference(&old) {
            *self.others.entry((*role).clone()).or_insert(0) += 1;
            changed = true;
        }
        changed
    }

    /// How many connected peers hold each role.
    pub fn others_roles(&self) -> &BTreeMap<String, usize> {
        &self.others
    }

    pub fn others_role_count(&self, role: &str) -> usize {
        self.others.get(role).copied().unwrap_or(0)
    }
}

impl std::fmt::Debug for RoleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleManager")
            .field("default_role", &self.default_role)
            .field("declared", &self.declared)
            .field("configured", &self.configured_ids())
            .field("others", &self.others)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::PeerId;
    use serde_json::Value;
    use std::sync::Arc;

    fn roles(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn manager() -> RoleManager {
        RoleManager::new("sync-all")
    }

    #[test]
    fn test_declare_is_idempotent() {
        let mut rm = manager();
        assert!(rm.declare("viewer"));
        assert!(!rm.declare("viewer"));
        assert_eq!(rm.declared(), roles(&["viewer"]).as_slice());

        assert!(rm.retract("viewer"));
        assert!(!rm.retract("viewer"));
        assert!(!rm.has_role("viewer"));
    }

    #[test]
    fn test_interest_filtering() {
        let mut rm = manager();
        rm.configure_role("gallery", ["photos"]);

        let gallery = roles(&["gallery"]);
        assert!(rm.is_interested(&gallery, "photos"));
        assert!(!rm.is_interested(&gallery, "captions"));
    }

    #[test]
    fn test_default_role_receives_everything() {
        let rm = manager();
        assert!(rm.is_interested(&roles(&["sync-all"]), "anything"));
        assert!(!rm.is_interested(&roles(&["viewer"]), "anything"));
        assert!(!rm.is_interested(&[], "anything"));
    }

    #[test]
    fn test_null_handler_still_counts_as_interest() {
        let mut rm = manager();
        rm.configure_role("editor", [RoleSubscription::id("doc")]);
        assert!(rm.is_interested(&roles(&["editor"]), "doc"));
        assert!(rm.resolve_callbacks("doc").is_empty());
    }

    #[test]
    fn test_configure_role_replaces_previous() {
        let mut rm = manager();
        rm.configure_role("gallery", ["photos", "captions"]);
        let ids = rm.configure_role("gallery", ["videos"]);

        assert_eq!(ids, roles(&["videos"]));
        assert_eq!(rm.configuration("gallery"), Some(roles(&["videos"])));
        assert!(!rm.is_interested(&roles(&["gallery"]), "photos"));
    }

    #[test]
    fn test_configured_ids_sorted() {
        let mut rm = manager();
        rm.configure_role("b", ["y", "x"]);
        rm.configure_role("a", ["z"]);
        let published = rm.configured_ids();

        assert_eq!(published.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(published["b"], roles(&["x", "y"]));
    }

    #[test]
    fn test_role_counts_never_negative() {
        let mut rm = manager();
        assert!(rm.update_role_counts(&[], &roles(&["x", "y"])));
        assert!(rm.update_role_counts(&[], &roles(&["x"])));
        assert_eq!(rm.others_role_count("x"), 2);

        rm.update_role_counts(&roles(&["x"]), &[]);
        assert_eq!(rm.others_role_count("x"), 1);
        rm.update_role_counts(&roles(&["x"]), &[]);
        rm.update_role_counts(&roles(&["x"]), &[]);
        assert_eq!(rm.others_role_count("x"), 0);
        assert!(!rm.others_roles().contains_key("x"));
        assert_eq!(rm.others_role_count("y"), 1);
    }

    #[test]
    fn test_role_counts_use_set_difference() {
        let mut rm = manager();
        rm.update_role_counts(&[], &roles(&["a", "b"]));
        assert!(!rm.update_role_counts(&roles(&["a", "b"]), &roles(&["b", "a"])));
        rm.update_role_counts(&roles(&["a", "b"]), &roles(&["b", "c"]));

        assert_eq!(rm.others_role_count("a"), 0);
        assert_eq!(rm.others_role_count("b"), 1);
        assert_eq!(rm.others_role_count("c"), 1);
    }

    #[test]
    fn test_resolve_callbacks_in_declaration_order() {
        let mut rm = manager();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let first = order.clone();
        let second = order.clone();
        rm.configure_role(
            "screen",
            [RoleSubscription::with_handler(
                "slides",
                Arc::new(move |_: &str, _: &Value, _: &PeerId| first.lock().push("screen")),
            )],
        );
        rm.configure_role(
            "remote",
            [RoleSubscription::with_handler(
                "slides",
                Arc::new(move |_: &str, _: &Value, _: &PeerId| second.lock().push("remote")),
            )],
        );

        rm.declare("sync-all");
        rm.declare("remote");
        rm.declare("screen");

        let handlers = rm.resolve_callbacks("slides");
        assert_eq!(handlers.len(), 2);
        let origin = PeerId::new("p");
        for handler in handlers {
            handler("slides", &Value::Null, &origin);
        }
        assert_eq!(*order.lock(), vec!["remote", "screen"]);
    }

    #[test]
    fn test_default_role_handlers_ignored() {
        let mut rm = manager();
        rm.configure_role(
            "sync-all",
            [RoleSubscription::with_handler("x", Arc::new(|_: &str, _: &Value, _: &PeerId| {}))],
        );
        rm.declare("sync-all");
        assert!(rm.resolve_callbacks("x").is_empty());
    }
}
