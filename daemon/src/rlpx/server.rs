//! TCP listener and dialer for RLPx connections.
//!
//! Every connection, inbound or outbound, gets its own task running a
//! [`Connection`]. All of them report to the single event channel returned
//! by [`RlpxServer::new`].

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kestrel_common::crypto::{KeyPair, NodeId};
use kestrel_common::tokio::net::{TcpListener, TcpStream};
use kestrel_common::tokio::sync::{mpsc, Mutex, RwLock};
use kestrel_common::tokio::time::timeout;
use log::{debug, error, info, warn};

use super::config::RlpxConfig;
use super::connection::{Connection, ConnectionEvent, ConnectionHandle, ConnectionId, PeerSet};
use super::error::{RlpxError, RlpxResult};
use super::message::{Capability, DisconnectReason, Hello};
use super::session::Session;

/// Capacity of the event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct RlpxServer {
    keypair: KeyPair,
    config: RlpxConfig,
    /// Taken by the accept loop on start.
    listener: Mutex<Option<TcpListener>>,
    local_address: SocketAddr,
    local_hello: Hello,
    required_capability: Option<Capability>,
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    /// Established connections by identity, one per peer.
    peers: Arc<PeerSet>,
    /// Identities being dialed.
    dialing: Mutex<HashSet<NodeId>>,
    events: mpsc::Sender<ConnectionEvent>,
    next_id: AtomicU64,
    running: AtomicBool,
}

impl RlpxServer {
    /// Bind the TCP listener and create the server.
    pub async fn new(
        config: RlpxConfig,
        keypair: KeyPair,
    ) -> RlpxResult<(Arc<Self>, mpsc::Receiver<ConnectionEvent>)> {
        let capabilities = config.parse_capabilities()?;
        let required_capability = config.parse_required_capability()?;

        let bind_address = config.get_bind_address();
        let listener = TcpListener::bind(&bind_address)
            .await
            .map_err(|e| RlpxError::BindFailed(bind_address.clone(), e))?;
        let local_address = listener.local_addr()?;

        let local_hello = Hello::new(
            config.client_id.clone(),
            capabilities,
            local_address.port(),
            *keypair.node_id(),
        );

        if log::log_enabled!(log::Level::Info) {
            info!(
                "RLPx listening on {} ({})",
                local_address,
                local_hello
                    .capabilities
                    .iter()
                    .map(Capability::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let server = Arc::new(Self {
            keypair,
            config,
            listener: Mutex::new(Some(listener)),
            local_address,
            local_hello,
            required_capability,
            connections: RwLock::new(HashMap::new()),
            peers: Arc::new(PeerSet::new()),
            dialing: Mutex::new(HashSet::new()),
            events: sender,
            next_id: AtomicU64::new(0),
            running: AtomicBool::new(false),
        });
        Ok((server, receiver))
    }

    pub fn node_id(&self) -> &NodeId {
        self.keypair.node_id()
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.config.handshake_timeout_secs)
    }

    /// Start accepting inbound connections.
    pub async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            if log::log_enabled!(log::Level::Warn) {
                warn!("RLPx server already running");
            }
            return;
        }

        let Some(listener) = self.listener.lock().await.take() else {
            return;
        };

        let server = Arc::clone(&self);
        kestrel_common::tokio::spawn_task("rlpx-accept", async move {
            server.accept_loop(listener).await;
        });
    }

    /// Stop accepting connections and disconnect every peer.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.connections().await {
            if let Err(e) = handle.disconnect(DisconnectReason::ClientQuitting).await {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Connection {} already closed: {}", handle.id(), e);
                }
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while self.running.load(Ordering::SeqCst) {
            let (stream, address) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    if log::log_enabled!(log::Level::Error) {
                        error!("Error accepting connection: {}", e);
                    }
                    continue;
                }
            };

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let count = self.peer_count().await;
            if count >= self.config.max_peers {
                if log::log_enabled!(log::Level::Debug) {
                    debug!(
                        "Rejecting connection from {}: {} peers connected",
                        address, count
                    );
                }
                continue;
            }

            if log::log_enabled!(log::Level::Debug) {
                debug!("Accepted connection from {}", address);
            }

            let session = Session::recipient(
                self.keypair.clone(),
                self.local_hello.clone(),
                self.required_capability.clone(),
            );
            self.spawn_connection(stream, session).await;
        }
    }

    /// Open an outbound connection to `remote_id` at `address`.
    ///
    /// Fails with [`RlpxError::AlreadyConnected`] while another dial to the
    /// same identity is in progress or a connection to it is open.
    pub async fn dial(
        self: &Arc<Self>,
        remote_id: NodeId,
        address: SocketAddr,
    ) -> RlpxResult<ConnectionHandle> {
        if remote_id == *self.node_id() {
            return Err(RlpxError::SelfConnection);
        }
        if self.is_connected(&remote_id).await || !self.dialing.lock().await.insert(remote_id) {
            return Err(RlpxError::AlreadyConnected(remote_id));
        }

        let result = self.connect(remote_id, address).await;
        self.dialing.lock().await.remove(&remote_id);
        result
    }

    async fn connect(
        self: &Arc<Self>,
        remote_id: NodeId,
        address: SocketAddr,
    ) -> RlpxResult<ConnectionHandle> {
        if self.peer_count().await >= self.config.max_peers {
            return Err(RlpxError::TooManyPeers(self.config.max_peers));
        }

        let stream = timeout(self.handshake_timeout(), TcpStream::connect(address))
            .await
            .map_err(|_| RlpxError::Timeout)??;

        if log::log_enabled!(log::Level::Debug) {
            debug!("Dialed {:?} at {}", remote_id, address);
        }

        let session = Session::initiator(
            self.keypair.clone(),
            remote_id,
            self.local_hello.clone(),
            self.required_capability.clone(),
        )?;
        Ok(self.spawn_connection(stream, session).await)
    }

    async fn spawn_connection(self: &Arc<Self>, stream: TcpStream, session: Session) -> ConnectionHandle {
        if let Err(e) = stream.set_nodelay(true) {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Failed to set TCP_NODELAY: {}", e);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (connection, handle) = Connection::new(
            id,
            stream,
            session,
            self.events.clone(),
            self.handshake_timeout(),
        );
        let connection = connection.with_peer_set(Arc::clone(&self.peers));
        self.connections.write().await.insert(id, handle.clone());

        let server = Arc::clone(self);
        kestrel_common::tokio::spawn_task(format!("rlpx-connection-{}", id), async move {
            connection.run().await;
            server.connections.write().await.remove(&id);
        });

        handle
    }

    /// Open connections.
    pub async fn peer_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connections(&self) -> Vec<ConnectionHandle> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Whether a connection with this remote identity is open.
    pub async fn is_connected(&self, remote_id: &NodeId) -> bool {
        self.connections
            .read()
            .await
            .values()
            .any(|handle| handle.remote_id() == Some(remote_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> RlpxConfig {
        RlpxConfig {
            bind_address: Some("127.0.0.1:0".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_server_creation() {
        let keypair = KeyPair::generate();
        let (server, _events) = RlpxServer::new(local_config(), keypair.clone())
            .await
            .unwrap();
        assert_eq!(server.node_id(), keypair.node_id());
        assert_ne!(server.local_address().port(), 0);
        assert_eq!(server.peer_count().await, 0);
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_invalid_capability_config() {
        let config = RlpxConfig {
            capabilities: vec!["bogus".to_string()],
            ..local_config()
        };
        assert!(matches!(
            RlpxServer::new(config, KeyPair::generate()).await,
            Err(RlpxError::InvalidCapability(_))
        ));
    }

    #[tokio::test]
    async fn test_dial_self_refused() {
        let (server, _events) = RlpxServer::new(local_config(), KeyPair::generate())
            .await
            .unwrap();
        let result = server.dial(*server.node_id(), server.local_address()).await;
        assert!(matches!(result, Err(RlpxError::SelfConnection)));
    }

    #[tokio::test]
    async fn test_max_peers() {
        let config = RlpxConfig {
            max_peers: 0,
            ..local_config()
        };
        let (server, _events) = RlpxServer::new(config, KeyPair::generate()).await.unwrap();
        let other = KeyPair::generate();
        let result = server.dial(*other.node_id(), server.local_address()).await;
        assert!(matches!(result, Err(RlpxError::TooManyPeers(0))));
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let (a, mut a_events) = RlpxServer::new(local_config(), KeyPair::generate())
            .await
            .unwrap();
        let (b, mut b_events) = RlpxServer::new(local_config(), KeyPair::generate())
            .await
            .unwrap();
        Arc::clone(&b).start().await;

        let handle = a.dial(*b.node_id(), b.local_address()).await.unwrap();
        assert!(a.is_connected(b.node_id()).await);
        assert!(matches!(
            a.dial(*b.node_id(), b.local_address()).await,
            Err(RlpxError::AlreadyConnected(_))
        ));

        let wait = Duration::from_secs(5);
        match timeout(wait, a_events.recv()).await.unwrap().unwrap() {
            ConnectionEvent::Established { capabilities, .. } => {
                assert_eq!(capabilities, vec![Capability::new("eth", 66)])
            }
            other => panic!("Unexpected {:?}", other),
        }
        match timeout(wait, b_events.recv()).await.unwrap().unwrap() {
            ConnectionEvent::Established { handle, hello, .. } => {
                assert_eq!(handle.remote_id(), Some(a.node_id()));
                assert_eq!(hello.listen_port, a.local_address().port());
            }
            other => panic!("Unexpected {:?}", other),
        }
        assert_eq!(b.peer_count().await, 1);

        handle.send(0x02, vec![0xc0], true).await.unwrap();
        match timeout(wait, b_events.recv()).await.unwrap().unwrap() {
            ConnectionEvent::Message { code, payload, .. } => {
                assert_eq!(code, 0x02);
                assert_eq!(&payload[..], &[0xc0]);
            }
            other => panic!("Unexpected {:?}", other),
        }

        a.stop().await;
        match timeout(wait, b_events.recv()).await.unwrap().unwrap() {
            ConnectionEvent::Disconnected { reason, remote_id, .. } => {
                assert_eq!(reason, DisconnectReason::ClientQuitting);
                assert_eq!(remote_id.as_ref(), Some(a.node_id()));
            }
            other => panic!("Unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_dials_to_one_identity() {
        let (a, _a_events) = RlpxServer::new(local_config(), KeyPair::generate())
            .await
            .unwrap();
        let (b, _b_events) = RlpxServer::new(local_config(), KeyPair::generate())
            .await
            .unwrap();
        Arc::clone(&b).start().await;

        let (first, second) = kestrel_common::tokio::join!(
            a.dial(*b.node_id(), b.local_address()),
            a.dial(*b.node_id(), b.local_address())
        );
        let refused = [&first, &second]
            .iter()
            .filter(|result| matches!(result, Err(RlpxError::AlreadyConnected(id)) if id == b.node_id()))
            .count();
        assert_eq!(refused, 1);
        assert!(first.is_ok() || second.is_ok());
        assert_eq!(a.peer_count().await, 1);
        assert!(a.dialing.lock().await.is_empty());
    }

    /// The established connection of `server`, once it has exactly one.
    async fn single_peer(server: &RlpxServer, remote_id: &NodeId) -> Option<ConnectionHandle> {
        if server.peer_count().await != 1 || server.peers.len().await != 1 {
            return None;
        }
        server.peers.get(remote_id).await
    }

    #[tokio::test]
    async fn test_crossed_dials_keep_one_connection() {
        let (a, _a_events) = RlpxServer::new(local_config(), KeyPair::generate())
            .await
            .unwrap();
        let (b, _b_events) = RlpxServer::new(local_config(), KeyPair::generate())
            .await
            .unwrap();
        Arc::clone(&a).start().await;
        Arc::clone(&b).start().await;

        let (a_dial, b_dial) = kestrel_common::tokio::join!(
            a.dial(*b.node_id(), b.local_address()),
            b.dial(*a.node_id(), a.local_address())
        );

        let (a_kept, b_kept) = timeout(Duration::from_secs(5), async {
            loop {
                if let (Some(a_kept), Some(b_kept)) = (
                    single_peer(&a, b.node_id()).await,
                    single_peer(&b, a.node_id()).await,
                ) {
                    if a_kept.is_outbound() != b_kept.is_outbound() {
                        return (a_kept, b_kept);
                    }
                }
                kestrel_common::tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(!a_kept.is_closed());
        assert!(!b_kept.is_closed());
        if a_dial.is_ok() && b_dial.is_ok() {
            // Both ends agree on the connection dialed by the lower identity
            assert_eq!(a_kept.is_outbound(), a.node_id() < b.node_id());
        }
    }
}
