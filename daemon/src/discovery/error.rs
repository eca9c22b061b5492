//! Error types for the discovery protocol.

use std::io::Error as IoError;
use std::net::AddrParseError;

use kestrel_common::crypto::{CryptoError, NodeId};
use kestrel_common::rlp::RlpError;
use thiserror::Error;

/// Error type for discovery protocol operations.
///
/// Packet-level errors (`InvalidHash`, `InvalidSignature`, `MalformedPayload`,
/// ...) are only ever logged and dropped by the server: a single UDP socket
/// serves many untrusted senders.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Address parsing error.
    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] AddrParseError),

    /// Socket bind error.
    #[error("Failed to bind UDP socket on {0}: {1}")]
    BindFailed(String, IoError),

    /// Invalid URL format.
    #[error("Invalid enode URL: {0}")]
    InvalidUrl(String),

    /// Packet shorter than the fixed header.
    #[error("Packet too small: expected at least {0} bytes, got {1}")]
    PacketTooSmall(usize, usize),

    /// Packet too large.
    #[error("Packet too large: {0} bytes exceeds maximum {1}")]
    PacketTooLarge(usize, usize),

    /// Leading hash does not match the packet content.
    #[error("Packet hash mismatch")]
    InvalidHash,

    /// Sender could not be recovered from the signature.
    #[error("Signature verification failed")]
    InvalidSignature,

    /// Unknown packet type byte.
    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u8),

    /// Body is not the expected RLP shape.
    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] RlpError),

    /// Endpoint field with an unsupported IP encoding.
    #[error("Invalid endpoint: IP must be 4 or 16 bytes, got {0}")]
    InvalidEndpoint(usize),

    /// Key material error.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Packet from a sender that has no conversation yet.
    #[error("Unknown sender: {0:?}")]
    UnknownSender(NodeId),

    /// Peer did not answer a ping in time.
    #[error("Peer {0:?} timed out")]
    Timeout(NodeId),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type alias for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
