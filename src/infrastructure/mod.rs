//! Infrastructure Layer
//!
//! Cross-cutting concerns shared by the session tasks and transports.

pub mod shutdown;

pub use shutdown::{shutdown_signal, ChannelGuard, ShutdownController};
