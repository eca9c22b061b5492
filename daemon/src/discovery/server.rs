//! UDP server for the discovery protocol.
//!
//! The discovery server handles:
//! - PING/PONG for liveness checks
//! - FINDNODES/NEIGHBORS for peer discovery
//! - Bootstrap node contact
//! - A periodic FINDNODES refresh over a rotating subset of verified peers
//! - A liveness sweep that drops and blacklists peers with unanswered pings
//!
//! Verified and removed peers are reported on the event channel returned by
//! [`DiscoveryServer::new`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kestrel_common::crypto::{KeyPair, NodeId, NODE_ID_SIZE};
use kestrel_common::tokio::net::UdpSocket;
use kestrel_common::tokio::sync::mpsc::{self, error::TrySendError};
use kestrel_common::time::{get_current_time_in_seconds, TimestampSeconds};
use kestrel_common::tokio::sync::{broadcast, RwLock, Semaphore};
use kestrel_common::tokio::time::interval;
use log::{debug, error, info, trace, warn};
use metrics::counter;

use super::config::DiscoveryConfig;
use super::error::{DiscoveryError, DiscoveryResult};
use super::messages::{
    Endpoint, FindNodes, Message, Neighbors, NodeInfo, Ping, Pong, MAX_NEIGHBORS,
};
use super::packet::{decode_packet, encode_message, Packet, MAX_PACKET_SIZE};
use super::peer::Peer;
use super::routing_table::RoutingTable;
use super::url::EnodeUrl;

/// Maximum concurrent packet handlers (DoS prevention).
const MAX_CONCURRENT_HANDLERS: usize = 64;

/// Capacity of the event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Refresh rounds needed to visit every verified peer once.
const REFRESH_SELECTOR_MODULUS: u64 = 10;

/// Most identities kept in the blacklist at once.
pub const MAX_BLACKLIST_SIZE: usize = 4096;

/// Notification for the layer above discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// The peer completed a ping round trip.
    Verified(NodeInfo),
    /// The peer stopped answering and was blacklisted.
    Removed(NodeId),
}

/// Identities dropped after a ping timeout, each ignored until a unix time.
#[derive(Debug, Default)]
struct Blacklist {
    banned_until: HashMap<NodeId, TimestampSeconds>,
}

impl Blacklist {
    fn is_banned(&self, id: &NodeId, now: TimestampSeconds) -> bool {
        self.banned_until.get(id).is_some_and(|until| *until > now)
    }

    /// Ban `id` until `until`. Expired bans are pruned first, and at
    /// capacity the ban ending soonest makes room.
    fn ban(&mut self, id: NodeId, until: TimestampSeconds, now: TimestampSeconds) {
        self.banned_until.retain(|_, banned_until| *banned_until > now);

        if self.banned_until.len() >= MAX_BLACKLIST_SIZE && !self.banned_until.contains_key(&id) {
            let soonest = self
                .banned_until
                .iter()
                .min_by_key(|(_, until)| **until)
                .map(|(id, _)| *id);
            if let Some(soonest) = soonest {
                self.banned_until.remove(&soonest);
            }
        }
        self.banned_until.insert(id, until);
    }

    fn len(&self) -> usize {
        self.banned_until.len()
    }
}

/// Discovery server handling UDP communication.
pub struct DiscoveryServer {
    /// UDP socket for sending/receiving packets.
    socket: Arc<UdpSocket>,
    /// Node identity.
    keypair: KeyPair,
    /// Endpoint advertised in outbound PINGs.
    local_endpoint: Endpoint,
    /// Known peers.
    routing_table: RoutingTable<Arc<Peer>>,
    /// Identities dropped after a ping timeout.
    blacklist: RwLock<Blacklist>,
    /// Outbound event queue.
    events: mpsc::Sender<DiscoveryEvent>,
    /// Configuration.
    config: DiscoveryConfig,
    /// Running flag.
    running: AtomicBool,
    /// Wakes the background loops on stop.
    exit_sender: broadcast::Sender<()>,
    /// Refresh round counter, selects which peers get queried.
    refresh_counter: AtomicU64,
    /// Semaphore to limit concurrent packet handlers.
    handler_semaphore: Arc<Semaphore>,
}

impl DiscoveryServer {
    /// Bind the UDP socket and create the server.
    ///
    /// `tcp_port` is the RLPx listening port advertised to other nodes.
    pub async fn new(
        config: DiscoveryConfig,
        keypair: KeyPair,
        tcp_port: u16,
    ) -> DiscoveryResult<(Arc<Self>, mpsc::Receiver<DiscoveryEvent>)> {
        let bind_address = config.get_bind_address();
        let socket = UdpSocket::bind(&bind_address)
            .await
            .map_err(|e| DiscoveryError::BindFailed(bind_address.clone(), e))?;

        let local_address = socket.local_addr()?;
        let local_endpoint = Endpoint::new(
            config.advertised_ip.unwrap_or(local_address.ip()),
            local_address.port(),
            tcp_port,
        );

        if log::log_enabled!(log::Level::Info) {
            info!(
                "Discovery server listening on {} (node_id: {})",
                local_address,
                keypair.node_id()
            );
        }

        let routing_table = RoutingTable::new(*keypair.node_id());
        let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let server = Arc::new(Self {
            socket: Arc::new(socket),
            keypair,
            local_endpoint,
            routing_table,
            blacklist: RwLock::new(Blacklist::default()),
            events: sender,
            config,
            running: AtomicBool::new(false),
            exit_sender: broadcast::channel(1).0,
            refresh_counter: AtomicU64::new(0),
            handler_semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_HANDLERS)),
        });
        Ok((server, receiver))
    }

    /// Get the local node identity.
    pub fn node_id(&self) -> &NodeId {
        self.keypair.node_id()
    }

    /// Our identity and advertised endpoint.
    pub fn local_node(&self) -> NodeInfo {
        NodeInfo::new(*self.keypair.node_id(), self.local_endpoint)
    }

    /// Address the UDP socket is bound to.
    pub fn local_address(&self) -> DiscoveryResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Get the routing table.
    pub fn routing_table(&self) -> &RoutingTable<Arc<Peer>> {
        &self.routing_table
    }

    /// Every peer that completed a ping round trip.
    pub async fn verified_peers(&self) -> Vec<NodeInfo> {
        self.routing_table
            .list()
            .await
            .into_iter()
            .filter(|entry| entry.payload().is_verified())
            .map(|entry| *entry.payload().info())
            .collect()
    }

    pub async fn is_blacklisted(&self, id: &NodeId) -> bool {
        self.blacklist
            .read()
            .await
            .is_banned(id, get_current_time_in_seconds())
    }

    async fn ban(&self, id: NodeId) {
        let now = get_current_time_in_seconds();
        let until = now.saturating_add(self.config.blacklist_duration_secs);
        self.blacklist.write().await.ban(id, until, now);
    }

    /// Check if the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the server. The background loops exit without handling
    /// another packet.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // No receivers when the server was never started
        let _ = self.exit_sender.send(());
    }

    /// Start the discovery server.
    pub async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            if log::log_enabled!(log::Level::Warn) {
                warn!("Discovery server already running");
            }
            return;
        }

        if log::log_enabled!(log::Level::Info) {
            info!("Starting discovery server");
        }

        // Spawn the receive loop first so boot replies are not lost
        let server = Arc::clone(&self);
        let exit = self.exit_sender.subscribe();
        kestrel_common::tokio::spawn_task("discovery-receive", async move {
            server.receive_loop(exit).await;
        });

        self.connect_bootstrap_nodes().await;

        let server = Arc::clone(&self);
        let exit = self.exit_sender.subscribe();
        kestrel_common::tokio::spawn_task("discovery-maintenance", async move {
            server.maintenance_loop(exit).await;
        });
    }

    /// Contact bootstrap nodes from configuration.
    async fn connect_bootstrap_nodes(&self) {
        for url_str in &self.config.bootstrap_nodes {
            match EnodeUrl::parse(url_str) {
                Ok(url) => {
                    if log::log_enabled!(log::Level::Info) {
                        info!("Contacting bootstrap node: {}", url);
                    }
                    if let Err(e) = self.boot(url.node).await {
                        if log::log_enabled!(log::Level::Warn) {
                            warn!("Failed to ping bootstrap node {}: {}", url, e);
                        }
                    }
                }
                Err(e) => {
                    if log::log_enabled!(log::Level::Error) {
                        error!("Invalid bootstrap node URL '{}': {}", url_str, e);
                    }
                }
            }
        }
    }

    /// Start a conversation with a node and ping it.
    ///
    /// Returns `false` when the node is ourselves, blacklisted, already
    /// known, or rejected by the routing table.
    pub async fn boot(&self, node: NodeInfo) -> DiscoveryResult<bool> {
        if node.id == *self.node_id() || self.is_blacklisted(&node.id).await {
            return Ok(false);
        }

        let peer = Arc::new(Peer::new(node));
        if !self.routing_table.add(node.id, Arc::clone(&peer)).await {
            return Ok(false);
        }

        self.ping(&peer).await?;
        Ok(true)
    }

    /// Main receive loop for handling incoming packets.
    async fn receive_loop(self: Arc<Self>, mut exit: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        while self.running.load(Ordering::SeqCst) {
            let received = kestrel_common::tokio::select! {
                biased;
                _ = exit.recv() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((len, from)) => {
                    if log::log_enabled!(log::Level::Trace) {
                        trace!("Received {} bytes from {}", len, from);
                    }
                    counter!("kestrel_discovery_packets_received").increment(1u64);

                    // Rate limiting: try to acquire a permit (non-blocking)
                    let permit = match self.handler_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            if log::log_enabled!(log::Level::Debug) {
                                debug!(
                                    "Dropping packet from {} (at handler capacity {})",
                                    from, MAX_CONCURRENT_HANDLERS
                                );
                            }
                            counter!("kestrel_discovery_packets_dropped").increment(1u64);
                            continue;
                        }
                    };

                    let data = buf[..len].to_vec();
                    let server = Arc::clone(&self);
                    kestrel_common::tokio::spawn_task("discovery-handle", async move {
                        let _permit = permit;
                        if let Err(e) = server.handle_packet(&data, from).await {
                            if log::log_enabled!(log::Level::Debug) {
                                debug!("Dropped packet from {}: {}", from, e);
                            }
                            counter!("kestrel_discovery_packets_dropped").increment(1u64);
                        }
                    });
                }
                Err(e) => {
                    if log::log_enabled!(log::Level::Error) {
                        error!("Error receiving packet: {}", e);
                    }
                }
            }
        }
    }

    /// Maintenance loop for periodic tasks.
    async fn maintenance_loop(self: Arc<Self>, mut exit: broadcast::Receiver<()>) {
        let mut refresh_timer = interval(Duration::from_secs(
            self.config.refresh_interval_secs.max(1),
        ));
        let mut sweep_timer = interval(Duration::from_millis(self.config.sweep_interval_ms.max(1)));

        while self.running.load(Ordering::SeqCst) {
            kestrel_common::tokio::select! {
                biased;
                _ = exit.recv() => break,
                _ = refresh_timer.tick() => {
                    self.refresh().await;
                }
                _ = sweep_timer.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// Handle an incoming datagram.
    pub async fn handle_packet(&self, data: &[u8], from: SocketAddr) -> DiscoveryResult<()> {
        let packet = decode_packet(data)?;
        if packet.sender == *self.node_id() {
            return Ok(());
        }

        if self.is_blacklisted(&packet.sender).await {
            if log::log_enabled!(log::Level::Trace) {
                trace!("Ignoring packet from blacklisted {:?}", packet.sender);
            }
            return Ok(());
        }

        let message = packet.message()?;
        if message.is_expired() && log::log_enabled!(log::Level::Trace) {
            // Expired packets are still processed
            trace!("Packet type {} from {} is expired", packet.packet_type, from);
        }

        match message {
            Message::Ping(ping) => self.handle_ping(&packet, ping, from).await,
            Message::Pong(pong) => {
                let peer = self.known_peer(&packet.sender).await?;
                self.handle_pong(&peer, pong).await
            }
            Message::FindNodes(find_nodes) => {
                let peer = self.known_peer(&packet.sender).await?;
                self.handle_find_nodes(&peer, find_nodes).await
            }
            Message::Neighbors(neighbors) => {
                let peer = self.known_peer(&packet.sender).await?;
                self.handle_neighbors(&peer, neighbors).await
            }
        }
    }

    async fn known_peer(&self, id: &NodeId) -> DiscoveryResult<Arc<Peer>> {
        self.routing_table
            .get(id)
            .await
            .ok_or(DiscoveryError::UnknownSender(*id))
    }

    /// Handle a PING message.
    ///
    /// Unknown senders get a conversation of their own, pinged back so that
    /// both sides complete a round trip.
    async fn handle_ping(&self, packet: &Packet, ping: Ping, from: SocketAddr) -> DiscoveryResult<()> {
        if log::log_enabled!(log::Level::Debug) {
            debug!("Received PING from {} ({:?})", from, packet.sender);
        }

        let sender_endpoint = Endpoint::new(from.ip(), from.port(), ping.from.tcp_port);
        let (peer, is_new) = match self.routing_table.get(&packet.sender).await {
            Some(peer) => (Some(peer), false),
            None => {
                let peer = Arc::new(Peer::new(NodeInfo::new(packet.sender, sender_endpoint)));
                if self
                    .routing_table
                    .add(packet.sender, Arc::clone(&peer))
                    .await
                {
                    (Some(peer), true)
                } else {
                    (None, false)
                }
            }
        };

        let pong = Pong::new(sender_endpoint, packet.hash);
        self.send_message(&Message::Pong(pong), from).await?;

        let Some(peer) = peer else {
            return Ok(());
        };

        peer.clear_ping(None).await;
        if !peer.set_verified() {
            if log::log_enabled!(log::Level::Info) {
                info!("Verified peer {:?} at {}", peer.id(), from);
            }
            counter!("kestrel_discovery_peers_verified").increment(1u64);
            self.emit(DiscoveryEvent::Verified(*peer.info()));
        }

        if is_new {
            self.ping(&peer).await?;
        }

        if !peer.set_queried() {
            self.find_nodes(&peer, *self.node_id()).await?;
        }

        Ok(())
    }

    /// Handle a PONG message.
    async fn handle_pong(&self, peer: &Peer, pong: Pong) -> DiscoveryResult<()> {
        if peer.clear_ping(Some(&pong.ping_hash)).await {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Received PONG from {:?}", peer.id());
            }
        } else if log::log_enabled!(log::Level::Debug) {
            debug!(
                "Received unsolicited PONG from {:?} (no matching pending PING)",
                peer.id()
            );
        }
        Ok(())
    }

    /// Handle a FINDNODES message.
    async fn handle_find_nodes(&self, peer: &Peer, find_nodes: FindNodes) -> DiscoveryResult<()> {
        let target = find_nodes.target.hash();
        let nodes: Vec<NodeInfo> = self
            .routing_table
            .closest(MAX_NEIGHBORS, |_| true, Some(&target))
            .await
            .into_iter()
            .map(|entry| *entry.payload().info())
            .collect();

        if log::log_enabled!(log::Level::Debug) {
            debug!(
                "Received FINDNODES from {:?}, answering with {} nodes",
                peer.id(),
                nodes.len()
            );
        }

        let to = peer.endpoint().udp_address();
        for neighbors in Neighbors::chunked(&nodes) {
            self.send_message(&Message::Neighbors(neighbors), to).await?;
        }
        Ok(())
    }

    /// Handle a NEIGHBORS message.
    async fn handle_neighbors(&self, peer: &Peer, neighbors: Neighbors) -> DiscoveryResult<()> {
        if log::log_enabled!(log::Level::Debug) {
            debug!(
                "Received NEIGHBORS from {:?} ({} nodes)",
                peer.id(),
                neighbors.nodes.len()
            );
        }

        for node in neighbors.nodes {
            if node.id == *self.node_id() || self.routing_table.exists(&node.id).await {
                continue;
            }

            if let Err(e) = self.boot(node).await {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Failed to ping neighbor {:?}: {}", node.id, e);
                }
            }
        }
        Ok(())
    }

    /// Sign and send a message.
    async fn send_message(&self, message: &Message, to: SocketAddr) -> DiscoveryResult<()> {
        let (data, _) = encode_message(self.keypair.private_key(), message);
        self.send_packet(&data, to).await
    }

    async fn send_packet(&self, data: &[u8], to: SocketAddr) -> DiscoveryResult<()> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(DiscoveryError::PacketTooLarge(data.len(), MAX_PACKET_SIZE));
        }

        self.socket.send_to(data, to).await?;

        if log::log_enabled!(log::Level::Trace) {
            trace!("Sent {} bytes to {}", data.len(), to);
        }
        Ok(())
    }

    /// Send a PING to a peer and start its response timer.
    pub async fn ping(&self, peer: &Peer) -> DiscoveryResult<()> {
        let ping = Ping::new(self.local_endpoint, *peer.endpoint());
        let (data, hash) = encode_message(self.keypair.private_key(), &Message::Ping(ping));

        // Recorded before sending so a fast PONG always finds it
        peer.record_ping(hash).await;
        self.send_packet(&data, peer.endpoint().udp_address()).await
    }

    /// Ask a peer for the nodes closest to `target`.
    pub async fn find_nodes(&self, peer: &Peer, target: NodeId) -> DiscoveryResult<()> {
        let message = Message::FindNodes(FindNodes::new(target));
        self.send_message(&message, peer.endpoint().udp_address())
            .await
    }

    /// Send FINDNODES for a random target to this round's subset of
    /// verified peers.
    pub async fn refresh(&self) {
        let round = self.refresh_counter.fetch_add(1, Ordering::SeqCst);
        let selector = round % REFRESH_SELECTOR_MODULUS;

        let peers: Vec<Arc<Peer>> = self
            .routing_table
            .list()
            .await
            .into_iter()
            .map(|entry| entry.into_payload())
            .filter(|peer| {
                peer.is_verified()
                    && peer.id().as_bytes()[NODE_ID_SIZE - 1] as u64 % REFRESH_SELECTOR_MODULUS
                        == selector
            })
            .collect();

        if peers.is_empty() {
            return;
        }

        if log::log_enabled!(log::Level::Debug) {
            debug!("Refresh round {}: querying {} peers", round, peers.len());
        }

        for peer in peers {
            let target = random_node_id();
            if let Err(e) = self.find_nodes(&peer, target).await {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("FINDNODES to {:?} failed: {}", peer.id(), e);
                }
            }
        }
    }

    /// Remove and blacklist peers whose PING went unanswered for too long.
    pub async fn sweep(&self) {
        let timeout = Duration::from_millis(self.config.ping_timeout_ms);

        let mut expired = Vec::new();
        for entry in self.routing_table.list().await {
            if entry.payload().ping_timed_out(timeout).await {
                expired.push(*entry.id());
            }
        }

        for id in expired {
            self.ban(id).await;
            if self.routing_table.remove(&id).await.is_some() {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("{}", DiscoveryError::Timeout(id));
                }
                counter!("kestrel_discovery_peers_timed_out").increment(1u64);
                self.emit(DiscoveryEvent::Removed(id));
            }
        }
    }

    fn emit(&self, event: DiscoveryEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                if log::log_enabled!(log::Level::Warn) {
                    warn!("Discovery event queue full, dropping {:?}", event);
                }
            }
            Err(TrySendError::Closed(_)) => {
                if log::log_enabled!(log::Level::Trace) {
                    trace!("Discovery event receiver dropped");
                }
            }
        }
    }
}

fn random_node_id() -> NodeId {
    let mut bytes = [0u8; NODE_ID_SIZE];
    for chunk in bytes.chunks_mut(32) {
        chunk.copy_from_slice(&rand::random::<[u8; 32]>());
    }
    NodeId::new(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::messages::message_type;
    use crate::discovery::packet::encode_packet;
    use std::net::{IpAddr, Ipv4Addr};

    fn local_config() -> DiscoveryConfig {
        DiscoveryConfig {
            bind_address: Some("127.0.0.1:0".to_string()),
            ..Default::default()
        }
    }

    async fn server() -> (Arc<DiscoveryServer>, mpsc::Receiver<DiscoveryEvent>) {
        DiscoveryServer::new(local_config(), KeyPair::generate(), 30303)
            .await
            .unwrap()
    }

    async fn raw_socket() -> (UdpSocket, Endpoint) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = socket.local_addr().unwrap();
        (socket, Endpoint::new(address.ip(), address.port(), 0))
    }

    async fn receive(socket: &UdpSocket) -> Packet {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        decode_packet(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn test_server_creation() {
        let (server, _events) = server().await;
        let local = server.local_node();
        assert_eq!(local.id, *server.node_id());
        assert_eq!(local.endpoint.ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_ne!(local.endpoint.udp_port, 0);
        assert_eq!(local.endpoint.tcp_port, 30303);
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_advertised_ip() {
        let config = DiscoveryConfig {
            advertised_ip: Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))),
            ..local_config()
        };
        let (server, _events) = DiscoveryServer::new(config, KeyPair::generate(), 1)
            .await
            .unwrap();
        assert_eq!(
            server.local_node().endpoint.ip,
            IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))
        );
    }

    #[tokio::test]
    async fn test_ping_from_unknown_sender() {
        let (server, mut events) = server().await;
        let (socket, endpoint) = raw_socket().await;
        let remote = KeyPair::generate();

        let ping = Message::Ping(Ping::new(endpoint, server.local_node().endpoint));
        let (data, ping_hash) = encode_message(remote.private_key(), &ping);
        let from = socket.local_addr().unwrap();
        server.handle_packet(&data, from).await.unwrap();

        // PONG echoing our hash, then a PING back, then FINDNODES
        let pong = receive(&socket).await;
        assert_eq!(pong.sender, *server.node_id());
        match pong.message().unwrap() {
            Message::Pong(pong) => assert_eq!(pong.ping_hash, ping_hash),
            other => panic!("Expected Pong, got {:?}", other),
        }
        assert_eq!(receive(&socket).await.packet_type, message_type::PING);
        assert_eq!(receive(&socket).await.packet_type, message_type::FINDNODES);

        let peer = server.routing_table().get(remote.node_id()).await.unwrap();
        assert!(peer.is_verified());
        assert!(peer.has_pending_ping().await);
        assert_eq!(
            events.try_recv().unwrap(),
            DiscoveryEvent::Verified(NodeInfo::new(*remote.node_id(), endpoint))
        );
    }

    #[tokio::test]
    async fn test_unknown_sender_non_ping_dropped() {
        let (server, _events) = server().await;
        let remote = KeyPair::generate();
        let message = Message::FindNodes(FindNodes::new(*remote.node_id()));
        let (data, _) = encode_message(remote.private_key(), &message);

        let result = server
            .handle_packet(&data, "127.0.0.1:1".parse().unwrap())
            .await;
        assert!(matches!(result, Err(DiscoveryError::UnknownSender(_))));
    }

    #[tokio::test]
    async fn test_forged_packet_rejected() {
        let (server, _events) = server().await;
        let remote = KeyPair::generate();
        let (mut data, _) = encode_packet(remote.private_key(), message_type::PING, b"\xc0");
        data[40] ^= 0x01;

        let result = server
            .handle_packet(&data, "127.0.0.1:1".parse().unwrap())
            .await;
        assert!(matches!(result, Err(DiscoveryError::InvalidHash)));
        assert_eq!(server.routing_table().size().await, 0);
    }

    #[tokio::test]
    async fn test_pong_clears_matching_ping() {
        let (server, _events) = server().await;
        let (socket, endpoint) = raw_socket().await;
        let remote = KeyPair::generate();

        assert!(server
            .boot(NodeInfo::new(*remote.node_id(), endpoint))
            .await
            .unwrap());
        let ping = receive(&socket).await;
        assert_eq!(ping.packet_type, message_type::PING);

        let peer = server.routing_table().get(remote.node_id()).await.unwrap();
        assert!(peer.has_pending_ping().await);

        let pong = Message::Pong(Pong::new(server.local_node().endpoint, ping.hash));
        let (data, _) = encode_message(remote.private_key(), &pong);
        server
            .handle_packet(&data, socket.local_addr().unwrap())
            .await
            .unwrap();
        assert!(!peer.has_pending_ping().await);
        // A pong alone does not verify
        assert!(!peer.is_verified());
    }

    #[tokio::test]
    async fn test_boot_rejects_self_and_duplicates() {
        let (server, _events) = server().await;
        assert!(!server.boot(server.local_node()).await.unwrap());

        let (_socket, endpoint) = raw_socket().await;
        let node = NodeInfo::new(*KeyPair::generate().node_id(), endpoint);
        assert!(server.boot(node).await.unwrap());
        assert!(!server.boot(node).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_nodes_answers_with_neighbors() {
        let (server, _events) = server().await;
        let (socket, endpoint) = raw_socket().await;
        let remote = KeyPair::generate();

        let known: Vec<NodeInfo> = (0..20u16)
            .map(|i| {
                NodeInfo::new(
                    *KeyPair::generate().node_id(),
                    Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 1000 + i, 1000 + i),
                )
            })
            .collect();
        for node in &known {
            server
                .routing_table()
                .add(node.id, Arc::new(Peer::new(*node)))
                .await;
        }
        server
            .routing_table()
            .add(
                *remote.node_id(),
                Arc::new(Peer::new(NodeInfo::new(*remote.node_id(), endpoint))),
            )
            .await;

        let request = Message::FindNodes(FindNodes::new(*remote.node_id()));
        let (data, _) = encode_message(remote.private_key(), &request);
        server
            .handle_packet(&data, socket.local_addr().unwrap())
            .await
            .unwrap();

        let mut received = Vec::new();
        while received.len() < MAX_NEIGHBORS {
            match receive(&socket).await.message().unwrap() {
                Message::Neighbors(neighbors) => received.extend(neighbors.nodes),
                other => panic!("Expected Neighbors, got {:?}", other),
            }
        }
        assert_eq!(received.len(), MAX_NEIGHBORS);
        // The requester is its own closest node
        assert_eq!(received[0].id, *remote.node_id());
    }

    #[tokio::test]
    async fn test_neighbors_boots_unknown_nodes() {
        let (server, _events) = server().await;
        let (socket, endpoint) = raw_socket().await;
        let (other_socket, other_endpoint) = raw_socket().await;
        let remote = KeyPair::generate();
        let other = KeyPair::generate();

        server
            .routing_table()
            .add(
                *remote.node_id(),
                Arc::new(Peer::new(NodeInfo::new(*remote.node_id(), endpoint))),
            )
            .await;

        let neighbors = Message::Neighbors(Neighbors::new(vec![
            server.local_node(),
            NodeInfo::new(*other.node_id(), other_endpoint),
        ]));
        let (data, _) = encode_message(remote.private_key(), &neighbors);
        server
            .handle_packet(&data, socket.local_addr().unwrap())
            .await
            .unwrap();

        assert!(server.routing_table().exists(other.node_id()).await);
        assert_eq!(server.routing_table().size().await, 2);
        assert_eq!(receive(&other_socket).await.packet_type, message_type::PING);
    }

    #[tokio::test]
    async fn test_sweep_removes_and_blacklists() {
        let config = DiscoveryConfig {
            ping_timeout_ms: 0,
            ..local_config()
        };
        let (server, mut events) = DiscoveryServer::new(config, KeyPair::generate(), 1)
            .await
            .unwrap();
        let (_socket, endpoint) = raw_socket().await;
        let node = NodeInfo::new(*KeyPair::generate().node_id(), endpoint);

        assert!(server.boot(node).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        server.sweep().await;

        assert!(!server.routing_table().exists(&node.id).await);
        assert!(server.is_blacklisted(&node.id).await);
        assert_eq!(events.try_recv().unwrap(), DiscoveryEvent::Removed(node.id));

        // Blacklisted identities are never booted again
        assert!(!server.boot(node).await.unwrap());
    }

    #[tokio::test]
    async fn test_blacklist_entries_expire() {
        let config = DiscoveryConfig {
            ping_timeout_ms: 0,
            blacklist_duration_secs: 0,
            ..local_config()
        };
        let (server, _events) = DiscoveryServer::new(config, KeyPair::generate(), 1)
            .await
            .unwrap();
        let (_socket, endpoint) = raw_socket().await;
        let node = NodeInfo::new(*KeyPair::generate().node_id(), endpoint);

        assert!(server.boot(node).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        server.sweep().await;

        assert!(!server.routing_table().exists(&node.id).await);
        assert!(!server.is_blacklisted(&node.id).await);
        assert!(server.boot(node).await.unwrap());
    }

    #[test]
    fn test_blacklist_ban_window() {
        let mut blacklist = Blacklist::default();
        let id = random_node_id();
        blacklist.ban(id, 1060, 1000);

        assert!(blacklist.is_banned(&id, 1000));
        assert!(blacklist.is_banned(&id, 1059));
        assert!(!blacklist.is_banned(&id, 1060));
        assert!(!blacklist.is_banned(&random_node_id(), 1000));

        // Expired bans are pruned on the next insertion
        blacklist.ban(random_node_id(), 2000, 1500);
        assert_eq!(blacklist.len(), 1);
    }

    #[test]
    fn test_blacklist_is_bounded() {
        let mut blacklist = Blacklist::default();
        let first = random_node_id();
        blacklist.ban(first, 10_000, 0);
        for i in 0..MAX_BLACKLIST_SIZE as u64 + 100 {
            blacklist.ban(random_node_id(), 20_000 + i, 0);
        }

        assert_eq!(blacklist.len(), MAX_BLACKLIST_SIZE);
        // The ban ending soonest made room first
        assert!(!blacklist.is_banned(&first, 0));

        // Re-banning a listed identity does not evict anyone
        let listed = *blacklist.banned_until.keys().next().unwrap();
        blacklist.ban(listed, 90_000, 0);
        assert_eq!(blacklist.len(), MAX_BLACKLIST_SIZE);
        assert!(blacklist.is_banned(&listed, 80_000));
    }

    #[tokio::test]
    async fn test_stopped_server_ignores_packets() {
        let (server, _events) = server().await;
        Arc::clone(&server).start().await;
        let (socket, endpoint) = raw_socket().await;
        let remote = KeyPair::generate();
        let ping = Message::Ping(Ping::new(endpoint, server.local_node().endpoint));

        // Answered while running
        let (data, _) = encode_message(remote.private_key(), &ping);
        socket
            .send_to(&data, server.local_address().unwrap())
            .await
            .unwrap();
        assert_eq!(receive(&socket).await.packet_type, message_type::PONG);
        // Drain the PING and FINDNODES that follow the PONG
        assert_eq!(receive(&socket).await.packet_type, message_type::PING);
        assert_eq!(receive(&socket).await.packet_type, message_type::FINDNODES);

        server.stop();
        assert!(!server.is_running());

        let other = KeyPair::generate();
        let (data, _) = encode_message(other.private_key(), &ping);
        socket
            .send_to(&data, server.local_address().unwrap())
            .await
            .unwrap();
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        assert!(
            tokio::time::timeout(Duration::from_millis(300), socket.recv_from(&mut buf))
                .await
                .is_err()
        );
        assert!(!server.routing_table().exists(other.node_id()).await);
    }

    #[tokio::test]
    async fn test_refresh_queries_selected_peers() {
        let (server, _events) = server().await;
        let (socket, endpoint) = raw_socket().await;

        // Identity whose last byte selects it in the first round
        let id = loop {
            let keypair = KeyPair::generate();
            if keypair.node_id().as_bytes()[NODE_ID_SIZE - 1] % 10 == 0 {
                break *keypair.node_id();
            }
        };
        let peer = Arc::new(Peer::new(NodeInfo::new(id, endpoint)));
        peer.set_verified();
        server.routing_table().add(id, peer).await;

        server.refresh().await;
        assert_eq!(receive(&socket).await.packet_type, message_type::FINDNODES);
    }
}
