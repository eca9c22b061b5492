//! Base protocol messages carried inside RLPx frames.
//!
//! A frame body is `rlp(code) || payload`. Codes below
//! [`BASE_PROTOCOL_LENGTH`] belong to the base protocol, everything above is
//! handed to the negotiated subprotocol with the offset removed.

use std::fmt;
use std::str::FromStr;

use kestrel_common::crypto::{NodeId, NODE_ID_SIZE};
use kestrel_common::rlp::{self, Rlp, RlpResult};
use serde::{Deserialize, Serialize};

use super::error::{RlpxError, RlpxResult};

/// Base protocol message codes.
pub mod code {
    pub const HELLO: u64 = 0x00;
    pub const DISCONNECT: u64 = 0x01;
    pub const PING: u64 = 0x02;
    pub const PONG: u64 = 0x03;
}

/// Number of message codes reserved for the base protocol.
pub const BASE_PROTOCOL_LENGTH: u64 = 0x10;

/// Version advertised in our Hello.
pub const BASE_PROTOCOL_VERSION: u64 = 5;

/// Lowest Hello version for which payloads are snappy compressed.
pub const SNAPPY_PROTOCOL_VERSION: u64 = 5;

/// Reason carried by a Disconnect message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    DisconnectRequested,
    TcpSubsystemError,
    BreachOfProtocol,
    UselessPeer,
    TooManyPeers,
    AlreadyConnected,
    IncompatibleProtocolVersion,
    NullNodeIdentity,
    ClientQuitting,
    UnexpectedIdentity,
    ConnectedToSelf,
    PingTimeout,
    IncompatibleSubprotocol,
    Unknown(u8),
}

impl DisconnectReason {
    pub fn code(&self) -> u8 {
        match self {
            Self::DisconnectRequested => 0x00,
            Self::TcpSubsystemError => 0x01,
            Self::BreachOfProtocol => 0x02,
            Self::UselessPeer => 0x03,
            Self::TooManyPeers => 0x04,
            Self::AlreadyConnected => 0x05,
            Self::IncompatibleProtocolVersion => 0x06,
            Self::NullNodeIdentity => 0x07,
            Self::ClientQuitting => 0x08,
            Self::UnexpectedIdentity => 0x09,
            Self::ConnectedToSelf => 0x0a,
            Self::PingTimeout => 0x0b,
            Self::IncompatibleSubprotocol => 0x10,
            Self::Unknown(code) => *code,
        }
    }

    /// Encode as a Disconnect payload: `[reason]`.
    pub fn encode(&self) -> Vec<u8> {
        Rlp::list(vec![Rlp::uint(self.code() as u64)]).encode()
    }

    /// Decode a Disconnect payload.
    ///
    /// Both `[reason]` and a bare `reason` are accepted, an empty list means
    /// the disconnect was simply requested.
    pub fn decode(payload: &[u8]) -> RlpResult<Self> {
        let (item, _) = rlp::decode_unstrict(payload)?;
        let code = match &item {
            Rlp::List(items) => match items.first() {
                Some(reason) => reason.as_u8()?,
                None => 0,
            },
            Rlp::Bytes(_) => item.as_u8()?,
        };
        Ok(Self::from(code))
    }
}

impl From<u8> for DisconnectReason {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Self::DisconnectRequested,
            0x01 => Self::TcpSubsystemError,
            0x02 => Self::BreachOfProtocol,
            0x03 => Self::UselessPeer,
            0x04 => Self::TooManyPeers,
            0x05 => Self::AlreadyConnected,
            0x06 => Self::IncompatibleProtocolVersion,
            0x07 => Self::NullNodeIdentity,
            0x08 => Self::ClientQuitting,
            0x09 => Self::UnexpectedIdentity,
            0x0a => Self::ConnectedToSelf,
            0x0b => Self::PingTimeout,
            0x10 => Self::IncompatibleSubprotocol,
            code => Self::Unknown(code),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::DisconnectRequested => "disconnect requested",
            Self::TcpSubsystemError => "TCP sub-system error",
            Self::BreachOfProtocol => "breach of protocol",
            Self::UselessPeer => "useless peer",
            Self::TooManyPeers => "too many peers",
            Self::AlreadyConnected => "already connected",
            Self::IncompatibleProtocolVersion => "incompatible p2p protocol version",
            Self::NullNodeIdentity => "null node identity received",
            Self::ClientQuitting => "client quitting",
            Self::UnexpectedIdentity => "unexpected identity in handshake",
            Self::ConnectedToSelf => "connected to self",
            Self::PingTimeout => "ping timeout",
            Self::IncompatibleSubprotocol => "incompatible subprotocol",
            Self::Unknown(code) => return write!(f, "unknown reason {:#04x}", code),
        };
        f.write_str(text)
    }
}

/// A named, versioned subprotocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub version: u32,
}

impl Capability {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    fn to_rlp(&self) -> Rlp {
        Rlp::list(vec![
            Rlp::bytes(self.name.as_bytes()),
            Rlp::uint(self.version as u64),
        ])
    }

    fn from_rlp(item: &Rlp) -> RlpResult<Self> {
        let fields = item.as_list_min(2)?;
        let name = String::from_utf8_lossy(fields[0].as_bytes()?).into_owned();
        let version = fields[1].as_u64()?;
        Ok(Self {
            name,
            version: u32::try_from(version).unwrap_or(u32::MAX),
        })
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

impl FromStr for Capability {
    type Err = RlpxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, version) = s
            .split_once('/')
            .ok_or_else(|| RlpxError::InvalidCapability(s.to_string()))?;
        if name.is_empty() {
            return Err(RlpxError::InvalidCapability(s.to_string()));
        }
        let version = version
            .parse()
            .map_err(|_| RlpxError::InvalidCapability(s.to_string()))?;
        Ok(Self::new(name, version))
    }
}

/// Capability negotiation message, sent by both sides right after the
/// handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub protocol_version: u64,
    pub client_id: String,
    pub capabilities: Vec<Capability>,
    pub listen_port: u16,
    pub node_id: NodeId,
}

impl Hello {
    pub fn new(
        client_id: impl Into<String>,
        capabilities: Vec<Capability>,
        listen_port: u16,
        node_id: NodeId,
    ) -> Self {
        Self {
            protocol_version: BASE_PROTOCOL_VERSION,
            client_id: client_id.into(),
            capabilities,
            listen_port,
            node_id,
        }
    }

    /// Whether the exact name and version is advertised.
    pub fn supports(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    /// Capabilities advertised by both `self` and `other`, sorted.
    pub fn shared_capabilities(&self, other: &Hello) -> Vec<Capability> {
        let mut shared: Vec<Capability> = self
            .capabilities
            .iter()
            .filter(|capability| other.supports(capability))
            .cloned()
            .collect();
        shared.sort();
        shared.dedup();
        shared
    }

    pub fn encode(&self) -> Vec<u8> {
        Rlp::list(vec![
            Rlp::uint(self.protocol_version),
            Rlp::bytes(self.client_id.as_bytes()),
            Rlp::list(self.capabilities.iter().map(Capability::to_rlp).collect()),
            Rlp::uint(self.listen_port as u64),
            Rlp::bytes(self.node_id.as_bytes()),
        ])
        .encode()
    }

    /// Decode a Hello payload. Trailing list elements are ignored.
    pub fn decode(payload: &[u8]) -> RlpResult<Self> {
        let (item, _) = rlp::decode_unstrict(payload)?;
        let fields = item.as_list_min(5)?;

        let capabilities = fields[2]
            .as_list()?
            .iter()
            .map(Capability::from_rlp)
            .collect::<RlpResult<Vec<_>>>()?;

        Ok(Self {
            protocol_version: fields[0].as_u64()?,
            client_id: String::from_utf8_lossy(fields[1].as_bytes()?).into_owned(),
            capabilities,
            listen_port: fields[3].as_u16()?,
            node_id: NodeId::new(fields[4].as_array::<NODE_ID_SIZE>()?),
        })
    }
}

/// Empty payload used by Ping and Pong.
pub fn empty_payload() -> Vec<u8> {
    Rlp::empty_list().encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::crypto::KeyPair;

    fn hello() -> Hello {
        Hello::new(
            "kestrel/v0.1.0",
            vec![Capability::new("eth", 66), Capability::new("snap", 1)],
            30303,
            *KeyPair::generate().node_id(),
        )
    }

    #[test]
    fn test_hello_roundtrip() {
        let hello = hello();
        assert_eq!(Hello::decode(&hello.encode()).unwrap(), hello);
    }

    #[test]
    fn test_hello_ignores_extra_fields() {
        let hello = hello();
        let mut fields = match rlp::decode(&hello.encode()).unwrap() {
            Rlp::List(fields) => fields,
            other => panic!("Expected list, got {:?}", other),
        };
        fields.push(Rlp::bytes(b"future"));
        let decoded = Hello::decode(&Rlp::list(fields).encode()).unwrap();
        assert_eq!(decoded, hello);
    }

    #[test]
    fn test_hello_too_short() {
        let payload = Rlp::list(vec![Rlp::uint(5), Rlp::bytes(b"x")]).encode();
        assert!(Hello::decode(&payload).is_err());
    }

    #[test]
    fn test_shared_capabilities() {
        let ours = hello();
        let mut theirs = hello();
        theirs.capabilities = vec![Capability::new("eth", 66), Capability::new("eth", 67)];
        assert_eq!(
            ours.shared_capabilities(&theirs),
            vec![Capability::new("eth", 66)]
        );
    }

    #[test]
    fn test_capability_parse() {
        assert_eq!(
            "eth/66".parse::<Capability>().unwrap(),
            Capability::new("eth", 66)
        );
        assert_eq!(Capability::new("snap", 1).to_string(), "snap/1");
        assert!("eth".parse::<Capability>().is_err());
        assert!("/66".parse::<Capability>().is_err());
        assert!("eth/x".parse::<Capability>().is_err());
    }

    #[test]
    fn test_disconnect_reason_codes() {
        let payload = DisconnectReason::IncompatibleSubprotocol.encode();
        assert_eq!(payload, vec![0xc1, 0x10]);
        assert_eq!(
            DisconnectReason::decode(&payload).unwrap(),
            DisconnectReason::IncompatibleSubprotocol
        );
        assert_eq!(
            DisconnectReason::decode(&[0x08]).unwrap(),
            DisconnectReason::ClientQuitting
        );
        assert_eq!(
            DisconnectReason::decode(&[0xc0]).unwrap(),
            DisconnectReason::DisconnectRequested
        );
        assert_eq!(DisconnectReason::from(0x42), DisconnectReason::Unknown(0x42));
        assert_eq!(DisconnectReason::Unknown(0x42).code(), 0x42);
    }
}
