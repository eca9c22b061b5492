//! enode:// URL parser for bootstrap nodes.
//!
//! Format: `enode://<node_id_hex>@<ip>:<tcp_port>[?discport=<udp_port>]`
//!
//! The node ID is the 128 hex character public key. Without `discport` the
//! UDP port equals the TCP port.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use kestrel_common::crypto::{NodeId, NODE_ID_SIZE};

use super::error::{DiscoveryError, DiscoveryResult};
use super::messages::{Endpoint, NodeInfo};

/// URL scheme for discovery nodes.
pub const ENODE_URL_SCHEME: &str = "enode://";

const DISCPORT_QUERY: &str = "discport=";

/// Parsed enode:// URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnodeUrl {
    pub node: NodeInfo,
}

impl EnodeUrl {
    pub fn new(node: NodeInfo) -> Self {
        Self { node }
    }

    /// Parse an enode:// URL string.
    pub fn parse(s: &str) -> DiscoveryResult<Self> {
        let rest = s.strip_prefix(ENODE_URL_SCHEME).ok_or_else(|| {
            DiscoveryError::InvalidUrl(format!(
                "URL must start with '{}', got: {}",
                ENODE_URL_SCHEME, s
            ))
        })?;

        let (node_id_hex, location) = rest.split_once('@').ok_or_else(|| {
            DiscoveryError::InvalidUrl(format!(
                "URL must contain '@' separator between node_id and address: {}",
                s
            ))
        })?;

        if node_id_hex.len() != NODE_ID_SIZE * 2 {
            return Err(DiscoveryError::InvalidUrl(format!(
                "Node ID must be {} hex characters, got {} characters",
                NODE_ID_SIZE * 2,
                node_id_hex.len()
            )));
        }
        let id = NodeId::from_hex(node_id_hex)
            .map_err(|e| DiscoveryError::InvalidUrl(format!("Invalid node ID: {}", e)))?;

        let (address_str, query) = match location.split_once('?') {
            Some((address, query)) => (address, Some(query)),
            None => (location, None),
        };

        let address: SocketAddr = address_str.parse().map_err(|e| {
            DiscoveryError::InvalidUrl(format!("Invalid socket address '{}': {}", address_str, e))
        })?;

        let udp_port = match query {
            Some(query) => {
                let value = query.strip_prefix(DISCPORT_QUERY).ok_or_else(|| {
                    DiscoveryError::InvalidUrl(format!("Unsupported query: {}", query))
                })?;
                value.parse::<u16>().map_err(|e| {
                    DiscoveryError::InvalidUrl(format!("Invalid discport '{}': {}", value, e))
                })?
            }
            None => address.port(),
        };

        let endpoint = Endpoint::new(address.ip(), udp_port, address.port());
        Ok(Self::new(NodeInfo::new(id, endpoint)))
    }
}

impl fmt::Display for EnodeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endpoint = &self.node.endpoint;
        write!(
            f,
            "{}{}@{}",
            ENODE_URL_SCHEME,
            self.node.id.to_hex(),
            endpoint.tcp_address()
        )?;
        if endpoint.udp_port != endpoint.tcp_port {
            write!(f, "?{}{}", DISCPORT_QUERY, endpoint.udp_port)?;
        }
        Ok(())
    }
}

impl FromStr for EnodeUrl {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<EnodeUrl> for NodeInfo {
    fn from(url: EnodeUrl) -> Self {
        url.node
    }
}
