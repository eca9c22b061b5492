//! Protocol messages for the discovery protocol.
//!
//! Message types:
//! - PING (0x01): `[version, from, to, expiration]`
//! - PONG (0x02): `[to, ping_hash, expiration]`
//! - FINDNODES (0x03): `[target, expiration]`
//! - NEIGHBORS (0x04): `[[ip, udp_port, tcp_port, node_id]...], expiration]`
//!
//! Endpoints are encoded as `[ip, udp_port, tcp_port]` where the IP is its
//! 4 or 16 raw bytes and ports are big-endian integers without leading zeros.
//! Decoding validates the list shape and accepts extra trailing elements.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use kestrel_common::crypto::{Hash, NodeId, HASH_SIZE, NODE_ID_SIZE};
use kestrel_common::rlp::{self, Rlp};
use kestrel_common::time::{get_current_time_in_seconds, is_expired};
use serde::{Deserialize, Serialize};

use super::error::{DiscoveryError, DiscoveryResult};

/// Message type identifiers.
pub mod message_type {
    pub const PING: u8 = 0x01;
    pub const PONG: u8 = 0x02;
    pub const FINDNODES: u8 = 0x03;
    pub const NEIGHBORS: u8 = 0x04;
}

/// Protocol version carried in PING.
pub const PING_VERSION: u64 = 4;

/// Expiration window in seconds for outbound messages.
pub const EXPIRATION_WINDOW: u64 = 60;

/// Number of closest nodes returned for a FINDNODES request.
pub const MAX_NEIGHBORS: usize = 16;

/// Records per NEIGHBORS packet, keeping each datagram under the size limit.
pub const NEIGHBORS_PER_PACKET: usize = 12;

/// Network location of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, udp_port: u16, tcp_port: u16) -> Self {
        Self {
            ip,
            udp_port,
            tcp_port,
        }
    }

    pub fn udp_address(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    pub fn tcp_address(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    fn ip_bytes(&self) -> Vec<u8> {
        match self.ip {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        }
    }

    pub fn to_rlp(&self) -> Rlp {
        Rlp::list(vec![
            Rlp::bytes(self.ip_bytes()),
            Rlp::uint(self.udp_port as u64),
            Rlp::uint(self.tcp_port as u64),
        ])
    }

    pub fn from_rlp(item: &Rlp) -> DiscoveryResult<Self> {
        let fields = item.as_list_min(3)?;
        Self::from_fields(fields)
    }

    fn from_fields(fields: &[Rlp]) -> DiscoveryResult<Self> {
        let ip = decode_ip(fields[0].as_bytes()?)?;
        let udp_port = fields[1].as_u16()?;
        let tcp_port = fields[2].as_u16()?;
        Ok(Self::new(ip, udp_port, tcp_port))
    }
}

fn decode_ip(bytes: &[u8]) -> DiscoveryResult<IpAddr> {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        return Ok(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    if let Ok(octets) = <[u8; 16]>::try_from(bytes) {
        return Ok(IpAddr::V6(Ipv6Addr::from(octets)));
    }
    Err(DiscoveryError::InvalidEndpoint(bytes.len()))
}

/// Identity plus endpoint of a discovered node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub endpoint: Endpoint,
}

impl NodeInfo {
    pub fn new(id: NodeId, endpoint: Endpoint) -> Self {
        Self { id, endpoint }
    }

    /// NEIGHBORS record: endpoint fields followed by the identity.
    pub fn to_rlp(&self) -> Rlp {
        let mut fields = match self.endpoint.to_rlp() {
            Rlp::List(fields) => fields,
            Rlp::Bytes(_) => Vec::new(),
        };
        fields.push(Rlp::bytes(self.id.as_bytes()));
        Rlp::list(fields)
    }

    pub fn from_rlp(item: &Rlp) -> DiscoveryResult<Self> {
        let fields = item.as_list_min(4)?;
        let endpoint = Endpoint::from_fields(fields)?;
        let id = NodeId::new(fields[3].as_array::<NODE_ID_SIZE>()?);
        Ok(Self { id, endpoint })
    }
}

fn expiration() -> u64 {
    get_current_time_in_seconds().saturating_add(EXPIRATION_WINDOW)
}

/// PING message for liveness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub version: u64,
    pub from: Endpoint,
    pub to: Endpoint,
    pub expiration: u64,
}

impl Ping {
    pub fn new(from: Endpoint, to: Endpoint) -> Self {
        Self {
            version: PING_VERSION,
            from,
            to,
            expiration: expiration(),
        }
    }
}

/// PONG message as response to PING.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub to: Endpoint,
    /// Hash of the PING packet this responds to.
    pub ping_hash: Hash,
    pub expiration: u64,
}

impl Pong {
    pub fn new(to: Endpoint, ping_hash: Hash) -> Self {
        Self {
            to,
            ping_hash,
            expiration: expiration(),
        }
    }
}

/// FINDNODES message to request nodes close to a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNodes {
    pub target: NodeId,
    pub expiration: u64,
}

impl FindNodes {
    pub fn new(target: NodeId) -> Self {
        Self {
            target,
            expiration: expiration(),
        }
    }
}

/// NEIGHBORS message containing a list of nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbors {
    pub nodes: Vec<NodeInfo>,
    pub expiration: u64,
}

impl Neighbors {
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        Self {
            nodes,
            expiration: expiration(),
        }
    }

    /// Split a node list into packets of at most `NEIGHBORS_PER_PACKET` records.
    pub fn chunked(nodes: &[NodeInfo]) -> Vec<Self> {
        if nodes.is_empty() {
            return vec![Self::new(Vec::new())];
        }
        nodes
            .chunks(NEIGHBORS_PER_PACKET)
            .map(|chunk| Self::new(chunk.to_vec()))
            .collect()
    }
}

/// Discovery message types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping(Ping),
    Pong(Pong),
    FindNodes(FindNodes),
    Neighbors(Neighbors),
}

impl Message {
    /// Get the message type ID.
    pub fn message_type(&self) -> u8 {
        match self {
            Message::Ping(_) => message_type::PING,
            Message::Pong(_) => message_type::PONG,
            Message::FindNodes(_) => message_type::FINDNODES,
            Message::Neighbors(_) => message_type::NEIGHBORS,
        }
    }

    pub fn expiration(&self) -> u64 {
        match self {
            Message::Ping(m) => m.expiration,
            Message::Pong(m) => m.expiration,
            Message::FindNodes(m) => m.expiration,
            Message::Neighbors(m) => m.expiration,
        }
    }

    /// Check if the message has expired (past expiration time).
    pub fn is_expired(&self) -> bool {
        is_expired(self.expiration())
    }

    /// RLP body of the message, without the packet type.
    pub fn encode_body(&self) -> Vec<u8> {
        let item = match self {
            Message::Ping(m) => Rlp::list(vec![
                Rlp::uint(m.version),
                m.from.to_rlp(),
                m.to.to_rlp(),
                Rlp::uint(m.expiration),
            ]),
            Message::Pong(m) => Rlp::list(vec![
                m.to.to_rlp(),
                Rlp::bytes(m.ping_hash.as_bytes()),
                Rlp::uint(m.expiration),
            ]),
            Message::FindNodes(m) => Rlp::list(vec![
                Rlp::bytes(m.target.as_bytes()),
                Rlp::uint(m.expiration),
            ]),
            Message::Neighbors(m) => Rlp::list(vec![
                Rlp::list(m.nodes.iter().map(NodeInfo::to_rlp).collect()),
                Rlp::uint(m.expiration),
            ]),
        };
        item.encode()
    }

    /// Decode a message from its packet type and RLP body.
    pub fn decode(packet_type: u8, body: &[u8]) -> DiscoveryResult<Self> {
        let item = rlp::decode(body)?;
        let message = match packet_type {
            message_type::PING => {
                let fields = item.as_list_min(4)?;
                Message::Ping(Ping {
                    version: fields[0].as_u64()?,
                    from: Endpoint::from_rlp(&fields[1])?,
                    to: Endpoint::from_rlp(&fields[2])?,
                    expiration: fields[3].as_u64()?,
                })
            }
            message_type::PONG => {
                let fields = item.as_list_min(3)?;
                Message::Pong(Pong {
                    to: Endpoint::from_rlp(&fields[0])?,
                    ping_hash: Hash::new(fields[1].as_array::<HASH_SIZE>()?),
                    expiration: fields[2].as_u64()?,
                })
            }
            message_type::FINDNODES => {
                let fields = item.as_list_min(2)?;
                Message::FindNodes(FindNodes {
                    target: NodeId::new(fields[0].as_array::<NODE_ID_SIZE>()?),
                    expiration: fields[1].as_u64()?,
                })
            }
            message_type::NEIGHBORS => {
                let fields = item.as_list_min(2)?;
                let nodes = fields[0]
                    .as_list()?
                    .iter()
                    .map(NodeInfo::from_rlp)
                    .collect::<DiscoveryResult<Vec<_>>>()?;
                Message::Neighbors(Neighbors {
                    nodes,
                    expiration: fields[1].as_u64()?,
                })
            }
            other => return Err(DiscoveryError::UnknownPacketType(other)),
        };
        Ok(message)
    }
}
