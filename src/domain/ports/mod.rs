mod key_value_store;
mod relay_client;
mod transport_channel;

pub use key_value_store::KeyValueStore;
pub use relay_client::{Announcement, EventTag, RelayClient, RelayEvent, WrappedMessage};
pub use transport_channel::{
    ChannelError, ChannelEvent, ChannelEventKind, ChannelKind, Inbound, InboundSink, Transport,
    TransportChannel, TransportError,
};
