//! Key-Value Store Port
//!
//! Host-supplied persistence for the device identity and the list of peers
//! to reconnect to.

/// Minimal string key-value storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: String);

    fn remove(&self, key: &str);
}
