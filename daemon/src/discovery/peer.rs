//! Per-peer conversation state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use kestrel_common::crypto::{Hash, NodeId};
use kestrel_common::tokio::sync::Mutex;

use super::messages::{Endpoint, NodeInfo};

/// Outstanding PING waiting for its PONG.
#[derive(Debug, Clone, Copy)]
struct PendingPing {
    hash: Hash,
    sent_at: Instant,
}

/// A remote node known to the discovery server.
///
/// The node info never changes after creation; liveness state is tracked
/// separately so that the same `Arc<Peer>` can be shared by the routing table
/// and in-flight handlers.
#[derive(Debug)]
pub struct Peer {
    info: NodeInfo,
    /// Set once the peer has pinged us.
    verified: AtomicBool,
    /// Set once we sent the peer a FINDNODES for our own identity.
    queried: AtomicBool,
    pending_ping: Mutex<Option<PendingPing>>,
}

impl Peer {
    pub fn new(info: NodeInfo) -> Self {
        Self {
            info,
            verified: AtomicBool::new(false),
            queried: AtomicBool::new(false),
            pending_ping: Mutex::new(None),
        }
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn id(&self) -> &NodeId {
        &self.info.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.info.endpoint
    }

    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::SeqCst)
    }

    /// Mark as verified, returning whether it already was.
    pub fn set_verified(&self) -> bool {
        self.verified.swap(true, Ordering::SeqCst)
    }

    /// Mark as queried, returning whether it already was.
    pub fn set_queried(&self) -> bool {
        self.queried.swap(true, Ordering::SeqCst)
    }

    /// Remember a PING we are about to send.
    pub async fn record_ping(&self, hash: Hash) {
        *self.pending_ping.lock().await = Some(PendingPing {
            hash,
            sent_at: Instant::now(),
        });
    }

    /// Clear the outstanding PING.
    ///
    /// With `hash`, only a PING with that packet hash is cleared. Returns
    /// whether something was cleared.
    pub async fn clear_ping(&self, hash: Option<&Hash>) -> bool {
        let mut pending = self.pending_ping.lock().await;
        match (pending.as_ref(), hash) {
            (Some(ping), Some(hash)) if ping.hash != *hash => false,
            (Some(_), _) => {
                *pending = None;
                true
            }
            (None, _) => false,
        }
    }

    pub async fn has_pending_ping(&self) -> bool {
        self.pending_ping.lock().await.is_some()
    }

    /// Whether the outstanding PING is older than `timeout`.
    pub async fn ping_timed_out(&self, timeout: Duration) -> bool {
        let pending = *self.pending_ping.lock().await;
        pending.is_some_and(|ping| ping.sent_at.elapsed() > timeout)
    }
}
