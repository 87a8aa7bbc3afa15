use crate::replication::{SessionConfig, DEFAULT_ROLE};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Identity
    pub peer_id: Option<String>,
    pub default_role: String,

    // Relay polling and reconnection
    pub poll_secs: u64,
    pub reconnect: bool,

    // Direct channels
    pub direct_addr: Option<String>,

    // Demo binary
    pub peers: usize,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_id: None,
            default_role: DEFAULT_ROLE.to_string(),
            poll_secs: 5,
            reconnect: false,
            direct_addr: None,
            peers: 3,
            debug: false,
        }
    }
}

impl Config {
    /// Session configuration for `peer_id`, or for the configured id when
    /// `peer_id` is empty.
    pub fn session_config(&self, peer_id: &str) -> anyhow::Result<SessionConfig> {
        let id = if peer_id.is_empty() {
            self.peer_id.clone().unwrap_or_default()
        } else {
            peer_id.to_string()
        };

        let mut config = SessionConfig::new(id)
            .default_role(self.default_role.clone())
            .poll_interval(Duration::from_secs(self.poll_secs))
            .reconnect(self.reconnect);

        if let Some(addr) = &self.direct_addr {
            let addr: SocketAddr = addr
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid XDSYNC_DIRECT_ADDR {}: {}", addr, e))?;
            config = config.direct_listen_addr(addr);
        }

        config.validate()?;
        Ok(config)
    }
}

pub fn load_config() -> anyhow::Result<Config> {
    let peer_id = std::env::var("XDSYNC_PEER_ID").ok().filter(|id| !id.is_empty());

    let default_role = std::env::var("XDSYNC_DEFAULT_ROLE")
        .unwrap_or_else(|_| DEFAULT_ROLE.to_string());

    let poll_secs = std::env::var("XDSYNC_POLL_SECS")
        .unwrap_or_else(|_| "5".to_string())
        .parse()
        .unwrap_or(5);

    let reconnect = std::env::var("XDSYNC_RECONNECT")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);

    let direct_addr = std::env::var("XDSYNC_DIRECT_ADDR").ok();

    let peers = std::env::var("XDSYNC_PEERS")
        .unwrap_or_else(|_| "3".to_string())
        .parse()
        .unwrap_or(3);

    let debug = std::env::var("XDSYNC_DEBUG").is_ok();

    Ok(Config {
        peer_id,
        default_role,
        poll_secs,
        reconnect,
        direct_addr,
        peers,
        debug,
    })
}
