//! Domain Layer
//!
//! Peers, devices, wire envelope and the ports the session core talks to.

pub mod entities;
pub mod ports;
pub mod value_objects;

pub use entities::{DeviceInfo, DeviceTally, DeviceType, PeerId, PeerInfo};
pub use value_objects::{
    ChannelId, ConnectionState, Envelope, PeerComparator, PeerOrder, RoleSubscription,
    SyncHandler,
};
