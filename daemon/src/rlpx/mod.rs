//! RLPx: the encrypted TCP transport between nodes.
//!
//! A connection starts with an ECIES handshake ([`handshake`]) that agrees
//! on per-session secrets, continues with authenticated frames ([`frame`])
//! and exchanges Hello before any subprotocol message is delivered
//! ([`session`]). [`RlpxServer`] accepts and dials connections and runs
//! each one as a [`Connection`] task.

pub mod config;
pub mod connection;
pub mod ecies;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mac;
pub mod message;
pub mod server;
pub mod session;

pub use config::RlpxConfig;
pub use connection::{Connection, ConnectionEvent, ConnectionHandle, ConnectionId};
pub use error::{RlpxError, RlpxResult};
pub use message::{Capability, DisconnectReason, Hello};
pub use server::RlpxServer;
pub use session::{Session, SessionEvent};
