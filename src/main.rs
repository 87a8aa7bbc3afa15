//! xd-sync - Multi-device session demo
//!
//! This is the composition root: it wires several sessions through an
//! in-memory relay, shares a list between them and prints the result.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;
use xd_sync::adapters::outbound::{InMemoryRelay, MemoryStore};
use xd_sync::config::load_config;
use xd_sync::domain::entities::PeerId;
use xd_sync::domain::ports::RelayClient;
use xd_sync::infrastructure::{shutdown_signal, ShutdownController};
use xd_sync::replication::{SessionAgent, SyncOptions};

const LIST_ID: &str = "playlist";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let count = cfg.peers.max(2);
    tracing::info!("starting xd-sync demo peers={} role={}", count, cfg.default_role);

    // ===== COMPOSITION ROOT =====

    let relay: Arc<dyn RelayClient> = Arc::new(InMemoryRelay::new());

    let mut agents = Vec::with_capacity(count);
    for i in 0..count {
        let id = match (&cfg.peer_id, i) {
            (Some(id), 0) => id.clone(),
            _ => format!("device-{}", i),
        };
        let mut session_cfg = cfg.session_config(&id)?;
        if i > 0 {
            session_cfg.direct_listen_addr = None;
        }

        let mut agent = SessionAgent::new(session_cfg, relay.clone(), Arc::new(MemoryStore::new())).await?;
        if i == 0 {
            spawn_event_logger(&mut agent);
        }
        agent.start().await?;
        agent.with_session(|s| s.synchronize(json!([]), SyncOptions::new().id(LIST_ID)))?;
        agents.push(agent);
    }

    let controller = ShutdownController::new();
    tokio::select! {
        result = run_demo(&agents) => result?,
        _ = shutdown_signal(controller.clone()) => {}
    }

    for agent in &agents {
        agent.stop().await;
    }
    tracing::info!("xd-sync demo finished");
    Ok(())
}

/// Connect everyone through the first device, let each device append to
/// the shared list, then print what every device ended up with.
#[cfg_attr(coverage_nightly, coverage(off))]
async fn run_demo(agents: &[SessionAgent]) -> anyhow::Result<()> {
    let Some(hub) = agents.first().map(SessionAgent::peer_id) else {
        return Ok(());
    };

    for agent in &agents[1..] {
        agent.with_session(|s| s.connect_to(&hub))?;
    }

    let everyone = agents.len() - 1;
    if !wait_until(|| agents.iter().all(|a| a.with_session(|s| s.connected_peers().len()) == everyone)).await {
        anyhow::bail!("devices did not connect in time");
    }

    for agent in agents {
        let name = agent.peer_id();
        agent.with_session(|s| {
            s.update(LIST_ID, |value| {
                if let Value::Array(items) = value {
                    items.push(json!(name.as_str()));
                }
            })
        })?;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let expected = agents.len();
    let converged = wait_until(|| {
        agents.iter().all(|a| {
            a.with_session(|s| s.value(LIST_ID).and_then(Value::as_array).map(Vec::len)) == Some(expected)
        })
    })
    .await;

    for agent in agents {
        let (id, position, value) =
            agent.with_session(|s| (s.peer_id().clone(), s.my_position(), s.value(LIST_ID).cloned()));
        println!("{} (rank {}): {}", id, position, value.unwrap_or(Value::Null));
    }

    if !converged {
        tracing::warn!("shared list did not converge on every device");
    }
    Ok(())
}

#[cfg_attr(coverage_nightly, coverage(off))]
async fn wait_until<F: Fn() -> bool>(done: F) -> bool {
    for _ in 0..100 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    done()
}

#[cfg_attr(coverage_nightly, coverage(off))]
fn spawn_event_logger(agent: &mut SessionAgent) {
    let Some(mut events) = agent.take_event_rx() else {
        return;
    };
    let id: PeerId = agent.peer_id();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::debug!("{} event {:?}", id, event);
        }
    });
}
