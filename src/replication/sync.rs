//! Sync Engine
//!
//! Catalogue of tracked values. Detects local mutations by comparing each
//! value with the snapshot last delivered, builds outbound sync payloads and
//! merges remote updates with last-applied-wins semantics.

use crate::domain::entities::PeerId;
use crate::domain::value_objects::SyncHandler;
use crate::replication::observe::{self, ChangeRecord};
use crate::replication::roles::RoleManager;
use crate::replication::types::{Delta, Message};
use serde_json::Value;
use std::collections::BTreeMap;

/// Errors raised by the sync engine.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no synchronized value with id {0}")]
    UnknownEntry(String),
    #[error("only arrays and objects can be synchronized")]
    NotTrackable,
    #[error("invalid delta for {0}")]
    InvalidDelta(String),
    #[error("update for {0} does not match the tracked value's shape")]
    ShapeMismatch(String),
}

/// Options for [`SyncEngine::track`].
#[derive(Clone, Default)]
pub struct SyncOptions {
    pub id: Option<String>,
    /// Receives remote updates instead of the default merge
    pub callback: Option<SyncHandler>,
    /// Mirror propagated changes to the relay
    pub forward_to_relay: bool,
}

impl SyncOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn callback(mut self, callback: SyncHandler) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn forward_to_relay(mut self, forward: bool) -> Self {
        self.forward_to_relay = forward;
        self
    }
}

impl std::fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOptions")
            .field("id", &self.id)
            .field("callback", &self.callback.is_some())
            .field("forward_to_relay", &self.forward_to_relay)
            .finish()
    }
}

/// A tracked value.
pub struct SyncEntry {
    pub id: String,
    pub value: Value,
    /// State as of the last delivery or remote apply
    snapshot: Value,
    pub callback: Option<SyncHandler>,
    pub forward_to_relay: bool,
}

impl SyncEntry {
    pub fn is_dirty(&self) -> bool {
        self.snapshot != self.value
    }
}

/// A sync message ready to be routed.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSync {
    pub id: String,
    pub data: Value,
    pub is_delta: bool,
    pub forward_to_relay: bool,
}

impl OutboundSync {
    pub fn to_message(&self) -> Message {
        Message::Sync {
            id: self.id.clone(),
            data: self.data.clone(),
            is_delta: self.is_delta,
        }
    }
}

/// How a remote update was consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Role handlers ran; the default merge was skipped
    RoleHandlers(usize),
    /// The entry's callback ran instead of the merge
    Callback,
    /// The default merge updated the local value
    Merged,
}

/// Tracked values keyed by id.
#[derive(Default)]
pub struct SyncEngine {
    entries: BTreeMap<String, SyncEntry>,
    next_generated: u64,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `value`. Returns the entry id.
    ///
    /// Tracking an id again replaces the previous entry.
    pub fn track(&mut self, value: Value, options: SyncOptions) -> Result<String, SyncError> {
        if !value.is_array() && !value.is_object() {
            return Err(SyncError::NotTrackable);
        }

        let id = match options.id {
            Some(id) => id,
            None => {
                let id = format!("sync{}", self.next_generated);
                self.next_generated += 1;
                tracing::warn!(
                    "generated sync id {}; generated ids can collide across peers, pass an explicit id",
                    id
                );
                id
            }
        };

        if self.entries.contains_key(&id) {
            tracing::warn!("replacing synchronized value {}", id);
        }

        let entry = SyncEntry {
            id: id.clone(),
            snapshot: value.clone(),
            value,
            callback: options.callback,
            forward_to_relay: options.forward_to_relay,
        };
        self.entries.insert(id.clone(), entry);
        Ok(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&SyncEntry> {
        self.entries.get(id)
    }

    pub fn value(&self, id: &str) -> Option<&Value> {
        self.entries.get(id).map(|e| &e.value)
    }

    /// Mutable access to a tracked value. Changes are picked up by the next
    /// [`take_changes`](Self::take_changes).
    pub fn value_mut(&mut self, id: &str) -> Option<&mut Value> {
        self.entries.get_mut(id).map(|e| &mut e.value)
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pending change record for one entry.
    pub fn detect(&self, id: &str) -> Option<ChangeRecord> {
        let entry = self.entries.get(id)?;
        observe::detect(&entry.snapshot, &entry.value)
    }

    /// Collect and deliver every pending local change.
    ///
    /// Snapshots advance to the current values.
    pub fn take_changes(&mut self) -> Vec<OutboundSync> {
        self.entries
            .values_mut()
            .filter_map(|entry| {
                let record = observe::detect(&entry.snapshot, &entry.value)?;
                let outbound = Self::outbound(entry, Some(record));
                entry.snapshot = entry.value.clone();
                Some(outbound)
            })
            .collect()
    }

    /// Deliver the pending change of a single entry, if any.
    pub fn take_change(&mut self, id: &str) -> Result<Option<OutboundSync>, SyncError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SyncError::UnknownEntry(id.to_string()))?;
        let Some(record) = observe::detect(&entry.snapshot, &entry.value) else {
            return Ok(None);
        };
        let outbound = Self::outbound(entry, Some(record));
        entry.snapshot = entry.value.clone();
        Ok(Some(outbound))
    }

    /// Full-value push of an entry. Receivers hold the current value
    /// afterwards, so the snapshot advances too.
    pub fn force(&mut self, id: &str) -> Result<OutboundSync, SyncError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SyncError::UnknownEntry(id.to_string()))?;
        let outbound = Self::outbound(entry, None);
        entry.snapshot = entry.value.clone();
        Ok(outbound)
    }

    /// Full current value of an entry without touching its snapshot.
    pub fn full(&self, id: &str) -> Option<OutboundSync> {
        self.entries.get(id).map(|entry| Self::outbound(entry, None))
    }

    /// Forget pending local changes of an entry.
    pub fn discard_changes(&mut self, id: &str) -> Result<(), SyncError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SyncError::UnknownEntry(id.to_string()))?;
        entry.snapshot = entry.value.clone();
        Ok(())
    }

    /// Consume a remote update.
    ///
    /// Role handlers take precedence over the entry callback, which takes
    /// precedence over the default merge. A merged update is not reported
    /// as a local change afterwards.
    pub fn apply(
        &mut self,
        id: &str,
        data: &Value,
        is_delta: bool,
        origin: &PeerId,
        roles: &RoleManager,
    ) -> Result<ApplyOutcome, SyncError> {
        let handlers = roles.resolve_callbacks(id);
        if !handlers.is_empty() {
            for handler in &handlers {
                handler(id, data, origin);
            }
            return Ok(ApplyOutcome::RoleHandlers(handlers.len()));
        }

        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SyncError::UnknownEntry(id.to_string()))?;

        if let Some(callback) = entry.callback.clone() {
            callback(id, data, origin);
            return Ok(ApplyOutcome::Callback);
        }

        merge(entry, data, is_delta)?;
        entry.snapshot = entry.value.clone();
        Ok(ApplyOutcome::Merged)
    }

    fn outbound(entry: &SyncEntry, record: Option<ChangeRecord>) -> OutboundSync {
        let delta = match (&record, &entry.value) {
            (Some(ChangeRecord::Sequence(splices)), Value::Array(current)) => {
                Some(observe::to_delta(splices, current))
            }
            _ => None,
        };

        match delta {
            Some(delta) if !delta.is_empty() => OutboundSync {
                id: entry.id.clone(),
                data: delta.to_value(),
                is_delta: true,
                forward_to_relay: entry.forward_to_relay,
            },
            _ => OutboundSync {
                id: entry.id.clone(),
                data: entry.value.clone(),
                is_delta: false,
                forward_to_relay: entry.forward_to_relay,
            },
        }
    }
}

/// Default merge of a remote update into a tracked value.
fn merge(entry: &mut SyncEntry, data: &Value, is_delta: bool) -> Result<(), SyncError> {
    match &mut entry.value {
        Value::Array(items) if is_delta => {
            let delta = Delta::from_value(data).map_err(|e| {
                tracing::warn!("dropping delta for {}: {}", entry.id, e);
                SyncError::InvalidDelta(entry.id.clone())
            })?;
            delta.apply_to(items);
        }
        Value::Array(items) => {
            let replacement = data
                .as_array()
                .ok_or_else(|| SyncError::ShapeMismatch(entry.id.clone()))?;
            items.clear();
            items.extend(replacement.iter().cloned());
        }
        Value::Object(fields) => {
            let incoming = data
                .as_object()
                .ok_or_else(|| SyncError::ShapeMismatch(entry.id.clone()))?;
            fields.retain(|key, _| incoming.contains_key(key));
            for (key, value) in incoming {
                fields.insert(key.clone(), value.clone());
            }
        }
        _ => return Err(SyncError::ShapeMismatch(entry.id.clone())),
    }
    Ok(())
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .field("next_generated", &self.next_generated)
            .finish()
    }
}
