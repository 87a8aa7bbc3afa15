//! Message Router
//!
//! Inbound: demultiplexes channel messages by type into the session's
//! components. Outbound: fans messages out to open connections, optionally
//! filtered by interest, without ever failing the caller.

use crate::domain::entities::{DeviceInfo, PeerId};
use crate::domain::ports::ChannelError;
use crate::domain::value_objects::Envelope;
use crate::replication::events::SessionEvent;
use crate::replication::registry::ConnectionRegistry;
use crate::replication::roles::RoleManager;
use crate::replication::session::Session;
use crate::replication::sync::SyncError;
use crate::replication::types::{Message, ProtocolError, RoleCommand, RoleConfiguration, RoleOperation};
use serde_json::Value;

/// Outcome of a fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Peers the message was handed to
    pub delivered: Vec<PeerId>,
    /// Peers whose channel was found closed; flagged for cleanup
    pub stale: Vec<PeerId>,
}

/// Send to every open connection.
pub fn send_to_all(registry: &ConnectionRegistry, envelope: &Envelope) -> BroadcastReport {
    fan_out(registry, envelope, |_| true)
}

/// Send to open connections interested in `data_id`.
pub fn send_to_interested(
    registry: &ConnectionRegistry,
    roles: &RoleManager,
    envelope: &Envelope,
    data_id: &str,
) -> BroadcastReport {
    fan_out(registry, envelope, |roles_of_peer| roles.is_interested(roles_of_peer, data_id))
}

fn fan_out<F>(registry: &ConnectionRegistry, envelope: &Envelope, wants: F) -> BroadcastReport
where
    F: Fn(&[String]) -> bool,
{
    let mut report = BroadcastReport::default();
    for conn in registry.open_connections() {
        if !wants(&conn.roles) {
            continue;
        }
        match conn.send(envelope) {
            Ok(()) => report.delivered.push(conn.id.clone()),
            Err(ChannelError::Closed(_)) => {
                tracing::warn!("skipping {} to {}: channel closed", envelope.kind, conn.id);
                report.stale.push(conn.id.clone());
            }
            Err(e) => tracing::warn!("failed to send {} to {}: {}", envelope.kind, conn.id, e),
        }
    }
    report
}

impl Session {
    /// Dispatch one message received from `from`.
    pub(super) fn route(&mut self, from: &PeerId, envelope: Envelope) {
        let message = match Message::decode(envelope) {
            Ok(message) => message,
            Err(ProtocolError::UnknownType(kind)) => {
                tracing::warn!("received unhandled message type {} from {}", kind, from);
                return;
            }
            Err(e) => {
                tracing::warn!("dropping message from {}: {}", from, e);
                self.events.emit(SessionEvent::Error {
                    peer: Some(from.clone()),
                    reason: e.to_string(),
                });
                return;
            }
        };

        tracing::trace!("{} message from {}", message.kind(), from);
        match message {
            Message::Connections(peers) => self.handle_connections(peers),
            Message::Data(data) => self.events.emit(SessionEvent::Data {
                from: from.clone(),
                data,
            }),
            Message::Roles(roles) => self.handle_roles(from, roles),
            Message::Device(device) => self.handle_device(from, device),
            Message::Sync { id, data, is_delta } => self.handle_sync(from, &id, &data, is_delta),
            Message::Role(command) => self.handle_role_command(from, command),
            Message::RoleConfigurations(config) => self.handle_role_configuration(from, config),
            Message::Hello(_) => tracing::debug!("ignoring hello from {} on open channel", from),
        }
    }

    /// Connect to the sender's peers we do not know yet.
    fn handle_connections(&mut self, peers: Vec<PeerId>) {
        for peer in peers {
            if peer == *self.registry.me() || self.registry.contains(&peer) {
                continue;
            }
            if let Err(e) = self.connect_to(&peer) {
                tracing::warn!("failed to connect to advertised peer {}: {}", peer, e);
            }
        }
    }

    fn handle_roles(&mut self, from: &PeerId, roles: Vec<String>) {
        let Some(conn) = self.registry.get_mut(from) else {
            return;
        };
        let old = std::mem::replace(&mut conn.roles, roles.clone());
        let push_state = std::mem::take(&mut conn.pending_initial_sync);

        if self.roles.update_role_counts(&old, &roles) {
            self.events
                .emit(SessionEvent::OthersRolesChanged(self.roles.others_roles().clone()));
        }

        if push_state {
            self.push_initial_state(from, &roles);
        }
    }

    /// First state push on the accepting side of a connection.
    fn push_initial_state(&mut self, to: &PeerId, remote_roles: &[String]) {
        // pending deltas go out first, or the peer would replay them on top of the full value
        self.flush_changes();

        let ids: Vec<String> = self
            .sync
            .ids()
            .filter(|id| self.roles.is_interested(remote_roles, id))
            .cloned()
            .collect();

        let mut sent = 0;
        for id in ids {
            let Some(outbound) = self.sync.full(&id) else {
                continue;
            };
            if self.send_to(to, &outbound.to_message().into_envelope()).is_err() {
                break;
            }
            sent += 1;
        }
        tracing::debug!("pushed {} synchronized values to {}", sent, to);
    }

    fn handle_device(&mut self, from: &PeerId, device: DeviceInfo) {
        let Some(conn) = self.registry.get_mut(from) else {
            return;
        };
        if let Some(previous) = conn.device.replace(device.clone()) {
            self.others_devices.decrement(previous.device_type);
        }
        self.others_devices.increment(device.device_type);
        self.events.emit(SessionEvent::Device {
            from: from.clone(),
            device,
        });
    }

    fn handle_sync(&mut self, from: &PeerId, id: &str, data: &Value, is_delta: bool) {
        match self.sync.apply(id, data, is_delta, from, &self.roles) {
            Ok(outcome) => {
                tracing::debug!("applied sync {} from {} ({:?})", id, from, outcome);
                self.events.emit(SessionEvent::RemoteSync {
                    id: id.to_string(),
                    from: from.clone(),
                });
            }
            Err(SyncError::UnknownEntry(_)) => {
                tracing::warn!("dropping sync for untracked id {} from {}", id, from);
            }
            Err(e) => {
                tracing::warn!("failed to apply sync {} from {}: {}", id, from, e);
                self.events.emit(SessionEvent::Error {
                    peer: Some(from.clone()),
                    reason: e.to_string(),
                });
            }
        }
    }

    fn handle_role_command(&mut self, from: &PeerId, command: RoleCommand) {
        tracing::info!("{} asked to {:?} role {}", from, command.operation, command.role);
        match command.operation {
            RoleOperation::Add => self.add_role(&command.role),
            RoleOperation::Remove => self.remove_role(&command.role),
        };
    }

    fn handle_role_configuration(&mut self, from: &PeerId, config: RoleConfiguration) {
        if let Some(conn) = self.registry.get_mut(from) {
            conn.role_configurations
                .insert(config.role, config.configurations);
        }
    }
}
