//! xd-sync Library
//!
//! Peer sessions, roles and value synchronization across the devices of
//! one user. Exposed as a library for the demo binary and integration tests.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod replication;

// Re-export commonly used types
pub use config::load_config;
pub use domain::entities::{DeviceInfo, DeviceType, PeerId, PeerInfo};
pub use domain::ports::{KeyValueStore, RelayClient, Transport, TransportChannel};
pub use replication::{
    Session, SessionAgent, SessionAgentBuilder, SessionConfig, SessionError, SessionEvent, SyncOptions,
};
