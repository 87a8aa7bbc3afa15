//! Session Configuration
//!
//! Configuration for a peer session.

use crate::domain::entities::DeviceType;
use crate::domain::value_objects::{lexical, numeric_aware, PeerComparator};
use std::net::SocketAddr;
use std::time::Duration;

/// Role implying interest in every synchronized value.
pub const DEFAULT_ROLE: &str = "sync-all";

/// Configuration for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Identifier of this peer. Empty means "use the stored id or generate one"
    pub peer_id: String,

    /// Human readable device name announced to peers
    pub device_name: String,

    /// Device class announced to peers (default: large)
    pub device_type: DeviceType,

    /// Role that receives all synchronized data (default: "sync-all")
    pub default_role: String,

    /// Interval between relay polls for available devices (default: 5s)
    pub poll_interval: Duration,

    /// Connect to the stored peer list on start (default: false)
    pub reconnect: bool,

    /// Address to accept direct connections on (default: none)
    pub direct_listen_addr: Option<SocketAddr>,

    /// Use a direct link whenever the peer's address is known (default: true)
    pub prefer_direct: bool,

    /// Compare numeric peer ids by value when ranking (default: false)
    pub numeric_peer_order: bool,

    /// Capacity hint for host event fan-out (default: 256)
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            peer_id: String::new(),
            device_name: String::new(),
            device_type: DeviceType::default(),
            default_role: DEFAULT_ROLE.to_string(),
            poll_interval: Duration::from_secs(5),
            reconnect: false,
            direct_listen_addr: None,
            prefer_direct: true,
            numeric_peer_order: false,
            event_buffer: 256,
        }
    }
}

impl SessionConfig {
    /// Create a new configuration with peer ID.
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            ..Default::default()
        }
    }

    /// Set the device name.
    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    pub fn device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    /// Set the default role.
    pub fn default_role(mut self, role: impl Into<String>) -> Self {
        self.default_role = role.into();
        self
    }

    /// Set the relay poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Accept direct connections on `addr`.
    pub fn direct_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.direct_listen_addr = Some(addr);
        self
    }

    pub fn prefer_direct(mut self, prefer: bool) -> Self {
        self.prefer_direct = prefer;
        self
    }

    pub fn numeric_peer_order(mut self, numeric: bool) -> Self {
        self.numeric_peer_order = numeric;
        self
    }

    pub fn event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size;
        self
    }

    /// Comparator used to rank connected peers.
    pub fn comparator(&self) -> PeerComparator {
        if self.numeric_peer_order {
            numeric_aware
        } else {
            lexical
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_role.is_empty() {
            return Err(ConfigError::MissingDefaultRole);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.peer_id.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidPeerId(self.peer_id.clone()));
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("default_role is required")]
    MissingDefaultRole,
    #[error("poll_interval must be greater than zero")]
    ZeroPollInterval,
    #[error("peer_id {0:?} must not contain whitespace")]
    InvalidPeerId(String),
}
