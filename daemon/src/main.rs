use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kestrel_common::crypto::{NodeId, NODE_ID_SIZE};
use kestrel_common::tokio::sync::mpsc;
use kestrel_common::tokio::time::{interval, timeout};
use kestrel_common::tokio::{select, signal, spawn_task};
use log::{debug, info, warn};

use kestrel_daemon::config::NodeConfig;
use kestrel_daemon::discovery::{DiscoveryEvent, DiscoveryServer, EnodeUrl};
use kestrel_daemon::rlpx::{ConnectionEvent, RlpxServer};

/// Time given to open connections to send their Disconnect on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = NodeConfig::parse();
    if let Some(path) = config.config_file.clone() {
        config = NodeConfig::from_file(&path)?;
    }

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    )
    .init();

    let keypair = config.load_keypair()?;
    info!("Kestrel node {} starting", keypair.node_id());

    let (rlpx, mut connection_events) = RlpxServer::new(config.rlpx.clone(), keypair.clone())
        .await
        .context("Failed to start the RLPx listener")?;
    Arc::clone(&rlpx).start().await;

    let (discovery, mut discovery_events) = if config.discovery.is_enabled() {
        let (server, events) =
            DiscoveryServer::new(config.discovery.clone(), keypair, rlpx.local_address().port())
                .await
                .context("Failed to start the discovery server")?;
        info!("Local node: {}", EnodeUrl::new(server.local_node()));
        Arc::clone(&server).start().await;
        (Some(server), Some(events))
    } else {
        info!("Discovery disabled");
        (None, None)
    };

    let modulus = config.rlpx.dial_selector_modulus.max(1);
    let mut dial_interval = interval(Duration::from_secs(config.dial_interval_secs.max(1)));
    let mut round = 0u64;

    loop {
        select! {
            _ = signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            _ = dial_interval.tick() => {
                if let Some(discovery) = &discovery {
                    dial_round(&rlpx, discovery, round, modulus).await;
                    round = (round + 1) % modulus;
                }
            }
            event = next_discovery_event(&mut discovery_events) => {
                log_discovery_event(event);
            }
            event = connection_events.recv() => {
                match event {
                    Some(event) => log_connection_event(event),
                    None => break,
                }
            }
        }
    }

    if let Some(discovery) = &discovery {
        discovery.stop();
    }
    rlpx.stop().await;

    // Let the connection tasks flush their Disconnect
    let drain = async {
        while rlpx.peer_count().await > 0 {
            match connection_events.recv().await {
                Some(event) => log_connection_event(event),
                None => break,
            }
        }
    };
    if timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Connections still open after {:?}", SHUTDOWN_GRACE);
    }

    Ok(())
}

/// Whether a verified peer is dialed in `round`.
fn is_dial_candidate(id: &NodeId, round: u64, modulus: u64) -> bool {
    id.as_bytes()[NODE_ID_SIZE - 1] as u64 % modulus == round
}

async fn dial_round(rlpx: &Arc<RlpxServer>, discovery: &DiscoveryServer, round: u64, modulus: u64) {
    for node in discovery.verified_peers().await {
        if !is_dial_candidate(&node.id, round, modulus) || rlpx.is_connected(&node.id).await {
            continue;
        }

        let rlpx = Arc::clone(rlpx);
        spawn_task(format!("dial-{}", node.endpoint.tcp_address()), async move {
            if let Err(e) = rlpx.dial(node.id, node.endpoint.tcp_address()).await {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Failed to dial {}: {}", node.endpoint.tcp_address(), e);
                }
            }
        });
    }
}

async fn next_discovery_event(
    events: &mut Option<mpsc::Receiver<DiscoveryEvent>>,
) -> DiscoveryEvent {
    if let Some(receiver) = events {
        if let Some(event) = receiver.recv().await {
            return event;
        }
        *events = None;
    }
    std::future::pending().await
}

fn log_discovery_event(event: DiscoveryEvent) {
    match event {
        DiscoveryEvent::Verified(node) => {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Discovered {}", EnodeUrl::new(node));
            }
        }
        DiscoveryEvent::Removed(id) => {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Peer {} stopped answering", id);
            }
        }
    }
}

fn log_connection_event(event: ConnectionEvent) {
    match event {
        ConnectionEvent::Established {
            handle,
            hello,
            capabilities,
        } => {
            info!(
                "Connection {} established with {} ({}), shared: {}",
                handle.id(),
                hello.node_id,
                hello.client_id,
                capabilities
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        ConnectionEvent::Message { id, code, payload } => {
            if log::log_enabled!(log::Level::Debug) {
                debug!(
                    "Connection {} message {:#x} ({} bytes)",
                    id,
                    code,
                    payload.len()
                );
            }
        }
        ConnectionEvent::Disconnected {
            id,
            remote_id,
            reason,
        } => match remote_id {
            Some(remote_id) => info!("Connection {} to {} closed: {}", id, remote_id, reason),
            None => info!("Connection {} closed: {}", id, reason),
        },
    }
}
