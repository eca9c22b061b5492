use std::io::Error as IoError;

use kestrel_common::crypto::{CryptoError, NodeId};
use kestrel_common::rlp::RlpError;
use thiserror::Error;

use super::message::DisconnectReason;

/// Errors that can occur on an RLPx connection.
///
/// Every error is fatal to the connection it happened on and to nothing else.
#[derive(Error, Debug)]
pub enum RlpxError {
    #[error(transparent)]
    Io(#[from] IoError),

    #[error("Failed to bind TCP listener on {0}: {1}")]
    BindFailed(String, IoError),

    #[error("Authentication tag mismatch")]
    InvalidTag,

    #[error("Invalid handshake signature")]
    InvalidSignature,

    #[error("Encrypted envelope too short: {0} bytes")]
    InvalidEnvelope(usize),

    #[error("Unknown base protocol opcode: {0:#x}")]
    UnknownOpcode(u64),

    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] RlpError),

    #[error("Snappy error: {0}")]
    Snappy(#[from] snap::Error),

    #[error("Frame too large: {0} bytes (max {1})")]
    FrameTooLarge(usize, usize),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Handshake timed out")]
    Timeout,

    #[error("Application message {0:#x} received before Hello")]
    UnexpectedMessage(u64),

    #[error("Handshake secrets requested before the key exchange completed")]
    HandshakeIncomplete,

    #[error("Refusing to connect to ourselves")]
    SelfConnection,

    #[error("Already connected to {0:?}")]
    AlreadyConnected(NodeId),

    #[error("Too many peers (max {0})")]
    TooManyPeers(usize),

    #[error("Invalid capability '{0}', expected <name>/<version>")]
    InvalidCapability(String),

    #[error("Disconnected: {0}")]
    Disconnected(DisconnectReason),

    #[error("Connection closed")]
    Closed,
}

impl RlpxError {
    /// Whether the peer violated the wire protocol, in which case a
    /// Disconnect is sent before the connection closes.
    pub fn is_protocol_breach(&self) -> bool {
        matches!(
            self,
            RlpxError::UnknownOpcode(_)
                | RlpxError::MalformedPayload(_)
                | RlpxError::Snappy(_)
                | RlpxError::FrameTooLarge(_, _)
                | RlpxError::UnexpectedMessage(_)
        )
    }

    /// Reason reported upward when this error ends a connection.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            RlpxError::Disconnected(reason) => *reason,
            RlpxError::Timeout => DisconnectReason::PingTimeout,
            RlpxError::SelfConnection => DisconnectReason::ConnectedToSelf,
            RlpxError::AlreadyConnected(_) => DisconnectReason::AlreadyConnected,
            RlpxError::TooManyPeers(_) => DisconnectReason::TooManyPeers,
            RlpxError::InvalidTag | RlpxError::InvalidSignature | RlpxError::InvalidEnvelope(_) => {
                DisconnectReason::BreachOfProtocol
            }
            e if e.is_protocol_breach() => DisconnectReason::BreachOfProtocol,
            _ => DisconnectReason::TcpSubsystemError,
        }
    }
}

pub type RlpxResult<T> = Result<T, RlpxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breach_classification() {
        assert!(RlpxError::UnknownOpcode(4).is_protocol_breach());
        assert!(RlpxError::MalformedPayload(RlpError::UnexpectedEnd).is_protocol_breach());
        assert!(!RlpxError::InvalidTag.is_protocol_breach());
        assert!(!RlpxError::Timeout.is_protocol_breach());
    }

    #[test]
    fn test_disconnect_reason() {
        assert_eq!(
            RlpxError::UnknownOpcode(5).disconnect_reason(),
            DisconnectReason::BreachOfProtocol
        );
        assert_eq!(
            RlpxError::Disconnected(DisconnectReason::ClientQuitting).disconnect_reason(),
            DisconnectReason::ClientQuitting
        );
        assert_eq!(
            RlpxError::Io(IoError::other("reset")).disconnect_reason(),
            DisconnectReason::TcpSubsystemError
        );
    }
}
