//! Task driving one [`Session`] over a byte stream.
//!
//! Each connection runs in its own task, so frames of one connection are
//! always processed in arrival order while connections progress in parallel.
//! The application talks to the task through a [`ConnectionHandle`] and
//! hears from it through [`ConnectionEvent`]s.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use kestrel_common::crypto::NodeId;
use kestrel_common::tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use kestrel_common::tokio::select;
use kestrel_common::tokio::sync::{mpsc, Mutex};
use kestrel_common::tokio::time::sleep;
use log::{debug, trace, warn};
use metrics::counter;

use super::error::{RlpxError, RlpxResult};
use super::message::{Capability, DisconnectReason, Hello};
use super::handshake::Role;
use super::session::{Session, SessionEvent};

/// Identifier of a connection, unique per server.
pub type ConnectionId = u64;

/// Capacity of a connection's command queue.
const COMMAND_CHANNEL_SIZE: usize = 256;

/// Socket read buffer.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// What happened on a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Hello exchange completed.
    Established {
        handle: ConnectionHandle,
        hello: Hello,
        capabilities: Vec<Capability>,
    },
    /// Subprotocol message, code relative to the subprotocol.
    Message {
        id: ConnectionId,
        code: u64,
        payload: Bytes,
    },
    /// The connection is gone. Sent exactly once per connection.
    Disconnected {
        id: ConnectionId,
        remote_id: Option<NodeId>,
        reason: DisconnectReason,
    },
}

#[derive(Debug)]
enum Command {
    Send {
        code: u64,
        payload: Vec<u8>,
        compress: bool,
    },
    Disconnect(DisconnectReason),
}

/// Cheap, clonable access to a running connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: bool,
    // Shared by every clone, set once the identity is known
    remote_id: Arc<OnceLock<NodeId>>,
    commands: mpsc::Sender<Command>,
    // Why the connection closed, set once when it does
    closed: Arc<OnceLock<DisconnectReason>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// We dialed this connection.
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Remote identity, unknown for inbound connections until the handshake.
    pub fn remote_id(&self) -> Option<&NodeId> {
        self.remote_id.get()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get().is_some()
    }

    /// Reason the connection closed with, once it has.
    pub fn close_reason(&self) -> Option<DisconnectReason> {
        self.closed.get().copied()
    }

    fn closed_error(&self) -> RlpxError {
        match self.close_reason() {
            Some(reason) => RlpxError::Disconnected(reason),
            None => RlpxError::Closed,
        }
    }

    /// Queue a subprotocol message, `code` relative to the subprotocol.
    ///
    /// With `compress` set the payload is snappy-compressed if the peer
    /// negotiated it in its Hello. Fails with [`RlpxError::Disconnected`]
    /// once the connection is gone.
    pub async fn send(
        &self,
        code: u64,
        payload: impl Into<Vec<u8>>,
        compress: bool,
    ) -> RlpxResult<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.commands
            .send(Command::Send {
                code,
                payload: payload.into(),
                compress,
            })
            .await
            .map_err(|_| self.closed_error())
    }

    /// Send Disconnect and close the connection.
    pub async fn disconnect(&self, reason: DisconnectReason) -> RlpxResult<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.commands
            .send(Command::Disconnect(reason))
            .await
            .map_err(|_| self.closed_error())
    }
}

/// Established connections by remote identity.
///
/// Shared by the connections of one server so that each identity keeps a
/// single connection. When two connections with the same peer overlap,
/// both ends keep the one dialed by the lower node id.
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: Mutex<HashMap<NodeId, ConnectionHandle>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, remote_id: &NodeId) -> Option<ConnectionHandle> {
        self.peers.lock().await.get(remote_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Register `handle` as the connection to `remote_id`, returning the
    /// connection that has to close, which may be `handle` itself.
    async fn claim(
        &self,
        local_id: &NodeId,
        remote_id: NodeId,
        handle: &ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let mut peers = self.peers.lock().await;
        let existing_outbound = peers
            .get(&remote_id)
            .filter(|existing| !existing.is_closed() && existing.id != handle.id)
            .map(ConnectionHandle::is_outbound);
        let Some(existing_outbound) = existing_outbound else {
            peers.insert(remote_id, handle.clone());
            return None;
        };

        let keep_outbound = *local_id < remote_id;
        if handle.outbound != existing_outbound && handle.outbound == keep_outbound {
            peers.insert(remote_id, handle.clone())
        } else {
            Some(handle.clone())
        }
    }

    /// Forget `remote_id` if `id` still holds it.
    async fn release(&self, remote_id: &NodeId, id: ConnectionId) {
        let mut peers = self.peers.lock().await;
        if peers.get(remote_id).is_some_and(|handle| handle.id == id) {
            peers.remove(remote_id);
        }
    }
}

/// A session and its stream, ready to be driven.
pub struct Connection<S> {
    stream: S,
    session: Session,
    handle: ConnectionHandle,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ConnectionEvent>,
    handshake_timeout: Duration,
    peers: Option<Arc<PeerSet>>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        id: ConnectionId,
        stream: S,
        session: Session,
        events: mpsc::Sender<ConnectionEvent>,
        handshake_timeout: Duration,
    ) -> (Self, ConnectionHandle) {
        let (sender, receiver) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let remote_id = OnceLock::new();
        if let Some(id) = session.remote_id() {
            let _ = remote_id.set(*id);
        }
        let handle = ConnectionHandle {
            id,
            outbound: session.role() == Role::Initiator,
            remote_id: Arc::new(remote_id),
            commands: sender,
            closed: Arc::new(OnceLock::new()),
        };

        let connection = Self {
            stream,
            session,
            handle: handle.clone(),
            commands: receiver,
            events,
            handshake_timeout,
            peers: None,
        };
        (connection, handle)
    }

    /// Keep at most one established connection per identity in `peers`.
    pub fn with_peer_set(mut self, peers: Arc<PeerSet>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Drive the connection until it closes, then report why.
    pub async fn run(mut self) -> DisconnectReason {
        let reason = match self.drive().await {
            Ok(reason) => reason,
            Err(e) => {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Connection {} failed: {}", self.handle.id, e);
                }
                e.disconnect_reason()
            }
        };

        // Flush whatever the session left, typically a Disconnect
        if self.session.has_outbound() {
            let outbound = self.session.take_outbound();
            if let Err(e) = self.stream.write_all(&outbound).await {
                if log::log_enabled!(log::Level::Trace) {
                    trace!("Final flush on connection {} failed: {}", self.handle.id, e);
                }
            }
        }
        let _ = self.stream.shutdown().await;

        let _ = self.handle.closed.set(reason);
        counter!("kestrel_rlpx_connections_closed").increment(1u64);

        let remote_id = self.session.remote_id().copied();
        if let (Some(peers), Some(remote_id)) = (&self.peers, &remote_id) {
            peers.release(remote_id, self.handle.id).await;
        }

        let event = ConnectionEvent::Disconnected {
            id: self.handle.id,
            remote_id,
            reason,
        };
        if self.events.send(event).await.is_err() && log::log_enabled!(log::Level::Trace) {
            trace!("Event receiver dropped");
        }
        reason
    }

    async fn flush(&mut self) -> RlpxResult<()> {
        if self.session.has_outbound() {
            let outbound = self.session.take_outbound();
            self.stream.write_all(&outbound).await?;
        }
        Ok(())
    }

    /// Returns the reason of an orderly close.
    async fn drive(&mut self) -> RlpxResult<DisconnectReason> {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let deadline = sleep(self.handshake_timeout);
        kestrel_common::tokio::pin!(deadline);

        // Initiator's auth
        self.flush().await?;

        loop {
            select! {
                read = self.stream.read(&mut buffer) => {
                    let n = read?;
                    if n == 0 {
                        return Err(RlpxError::Closed);
                    }
                    let events = self.session.receive(&buffer[..n])?;
                    self.flush().await?;
                    if let Some(reason) = self.dispatch(events).await {
                        return Ok(reason);
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Send { code, payload, compress }) => {
                            self.session.send(code, payload, compress)?;
                            self.flush().await?;
                        }
                        Some(Command::Disconnect(reason)) => {
                            self.session.disconnect(reason)?;
                            self.flush().await?;
                            return Ok(reason);
                        }
                        None => {
                            self.session.disconnect(DisconnectReason::ClientQuitting)?;
                            self.flush().await?;
                            return Ok(DisconnectReason::ClientQuitting);
                        }
                    }
                }
                _ = &mut deadline, if !self.session.is_established() => {
                    if log::log_enabled!(log::Level::Debug) {
                        debug!("Connection {} did not complete its handshake in time", self.handle.id);
                    }
                    self.session.disconnect(DisconnectReason::PingTimeout)?;
                    self.flush().await?;
                    return Err(RlpxError::Timeout);
                }
            }
        }
    }

    /// Forward session events, returning the reason if one closed it.
    async fn dispatch(&mut self, events: Vec<SessionEvent>) -> Option<DisconnectReason> {
        for event in events {
            let event = match event {
                SessionEvent::Established {
                    remote_id,
                    hello,
                    capabilities,
                } => {
                    let _ = self.handle.remote_id.set(remote_id);
                    if let Some(reason) = self.admit(remote_id).await {
                        return Some(reason);
                    }
                    counter!("kestrel_rlpx_connections_established").increment(1u64);
                    if log::log_enabled!(log::Level::Debug) {
                        debug!(
                            "Connection {} established with {:?} ({})",
                            self.handle.id, remote_id, hello.client_id
                        );
                    }
                    ConnectionEvent::Established {
                        handle: self.handle.clone(),
                        hello,
                        capabilities,
                    }
                }
                SessionEvent::Message { code, payload } => ConnectionEvent::Message {
                    id: self.handle.id,
                    code,
                    payload: Bytes::from(payload),
                },
                SessionEvent::Disconnected { reason, local } => {
                    if log::log_enabled!(log::Level::Debug) {
                        debug!(
                            "Connection {} closed ({}): {}",
                            self.handle.id,
                            if local { "local" } else { "remote" },
                            reason
                        );
                    }
                    return Some(reason);
                }
            };

            if self.events.send(event).await.is_err() {
                if log::log_enabled!(log::Level::Warn) {
                    warn!("Event receiver dropped, closing connection {}", self.handle.id);
                }
                return Some(DisconnectReason::ClientQuitting);
            }
        }
        None
    }

    /// Settle a duplicate connection to `remote_id`. Returns a reason when
    /// this connection is the one to go.
    async fn admit(&mut self, remote_id: NodeId) -> Option<DisconnectReason> {
        let peers = self.peers.as_ref()?;
        let loser = peers
            .claim(self.session.local_id(), remote_id, &self.handle)
            .await?;

        if log::log_enabled!(log::Level::Debug) {
            debug!(
                "Duplicate connection to {:?}, closing connection {}",
                remote_id, loser.id
            );
        }
        counter!("kestrel_rlpx_duplicate_connections").increment(1u64);

        if loser.id == self.handle.id {
            // Left in the outbound buffer, flushed by run()
            let _ = self.session.disconnect(DisconnectReason::AlreadyConnected);
            return Some(DisconnectReason::AlreadyConnected);
        }
        if let Err(e) = loser.disconnect(DisconnectReason::AlreadyConnected).await {
            if log::log_enabled!(log::Level::Trace) {
                trace!("Connection {} already closing: {}", loser.id, e);
            }
        }
        None
    }
}
