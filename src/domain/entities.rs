//! Domain Entities - Core session objects
//!
//! These entities represent the peers and devices taking part in a shared
//! session. They have no I/O dependencies and contain only domain logic.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Unique identifier for a peer (device/process) in the session.
///
/// Stable across reconnects: the host persists it and hands it back on the
/// next start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier for a peer that has none stored yet.
    pub fn generate() -> Self {
        Self(format!("Id{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coarse device class advertised to other peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Small,
    Medium,
    #[default]
    Large,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

/// Description of a device as announced in `device` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: PeerId,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

impl DeviceInfo {
    pub fn new(id: PeerId, name: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            id,
            name: name.into(),
            device_type,
            width: 0,
            height: 0,
        }
    }
}

/// Aggregate count of device classes among connected peers.
///
/// Maintained incrementally: a connected peer contributes exactly one count
/// for its last announced device type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceTally {
    pub small: usize,
    pub medium: usize,
    pub large: usize,
}

impl DeviceTally {
    pub fn get(&self, device_type: DeviceType) -> usize {
        match device_type {
            DeviceType::Small => self.small,
            DeviceType::Medium => self.medium,
            DeviceType::Large => self.large,
        }
    }

    pub fn increment(&mut self, device_type: DeviceType) {
        *self.slot(device_type) += 1;
    }

    /// Decrement, never going below zero.
    pub fn decrement(&mut self, device_type: DeviceType) {
        let slot = self.slot(device_type);
        *slot = slot.saturating_sub(1);
    }

    fn slot(&mut self, device_type: DeviceType) -> &mut usize {
        match device_type {
            DeviceType::Small => &mut self.small,
            DeviceType::Medium => &mut self.medium,
            DeviceType::Large => &mut self.large,
        }
    }
}

/// A peer as reported by the relay's `listAllPeers` query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
    /// Address a direct channel can be dialed on, when the peer listens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<SocketAddr>,
}

impl PeerInfo {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            name: None,
            device_type: None,
            addr: None,
        }
    }

    pub fn with_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.addr = addr;
        self
    }
}
