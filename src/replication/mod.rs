//! Peer Session Module
//!
//! Connects the devices of one user into a session and keeps shared values
//! consistent between them.
//!
//! ## Architecture
//!
//! - **Registry**: one connection per remote peer, with conflict handling
//!   for simultaneous dials and a ranking of connected peers
//! - **Roles**: declared roles, role-to-data subscriptions and the
//!   aggregate role counts of other peers
//! - **Sync**: tracked values, change detection (splices for arrays,
//!   key diffs for objects) and application of remote updates
//! - **Router**: message dispatch by type and interest-filtered fan-out
//! - **Session**: the synchronous state machine tying it all together
//! - **Agent**: runs a session on tokio
//!
//! ## How It Works
//!
//! 1. A session identifies with the relay and announces its device and roles
//! 2. Channels are opened directly over TCP when the peer's address is
//!    known, or simulated through the relay otherwise
//! 3. On open both sides exchange their peers, roles and device; the
//!    accepting side then pushes the full state the other side wants
//! 4. Local edits go out as deltas to the peers interested in them
//!
//! ## Usage
//!
//! ```rust,ignore
//! use xd_sync::adapters::outbound::{InMemoryRelay, MemoryStore};
//! use xd_sync::replication::{SessionAgentBuilder, SyncOptions};
//!
//! let mut agent = SessionAgentBuilder::new("tv")
//!     .build(Arc::new(InMemoryRelay::new()), Arc::new(MemoryStore::new()))
//!     .await?;
//! agent.start().await?;
//! agent.with_session(|s| s.synchronize(json!([]), SyncOptions::new().id("playlist")))?;
//! ```

mod agent;
mod config;
mod events;
pub mod observe;
mod registry;
mod roles;
mod router;
mod session;
mod sync;
pub mod types;

pub use agent::{SessionAgent, SessionAgentBuilder};
pub use config::{ConfigError, SessionConfig, DEFAULT_ROLE};
pub use events::{EventBus, EventHandler, EventKind, SessionEvent, SubscriptionId};
pub use registry::{AcceptOutcome, Connection, ConnectionRegistry};
pub use roles::RoleManager;
pub use router::{send_to_all, send_to_interested, BroadcastReport};
pub use session::{Session, SessionError, DEVICE_ID_KEY, DEVICE_NAME_KEY, PEERS_KEY};
pub use sync::{ApplyOutcome, OutboundSync, SyncEngine, SyncEntry, SyncError, SyncOptions};
pub use types::{Delta, Message, ProtocolError, RoleCommand, RoleConfiguration, RoleOperation, Splice};
