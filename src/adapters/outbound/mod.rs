mod memory_relay;
mod memory_store;
mod relayed_channel;
mod tcp_direct_transport;

pub use memory_relay::{InMemoryRelay, PeerAnnouncements};
pub use memory_store::MemoryStore;
pub use relayed_channel::{RelayTransport, RelayedChannel};
pub use tcp_direct_transport::{DirectChannel, TcpDirectTransport};
