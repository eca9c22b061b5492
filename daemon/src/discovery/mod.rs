//! UDP peer discovery.
//!
//! Nodes find each other with a Kademlia-style routing table keyed by the
//! keccak256 hash of their 64-byte public key identity. All datagrams are
//! signed; the sender identity is recovered from the signature.
//!
//! ## Message Types
//!
//! | Type | ID | Description |
//! |------|-----|-------------|
//! | PING | 0x01 | Liveness check, carries both endpoints |
//! | PONG | 0x02 | Echoes the hash of the PING it answers |
//! | FINDNODES | 0x03 | Request nodes close to a target identity |
//! | NEIGHBORS | 0x04 | Response with node records |
//!
//! ## Node URL Format
//!
//! ```text
//! enode://<node_id_hex>@<ip>:<tcp_port>[?discport=<udp_port>]
//! ```
//!
//! ## Constants
//!
//! - Default discovery port: 30303
//! - Bucket size: 16 nodes
//! - FINDNODES answer size: 16 nodes
//! - Max packet size: 1280 bytes
//! - Message expiration: 60 seconds

pub mod config;
pub mod error;
pub mod identity;
pub mod messages;
pub mod packet;
pub mod peer;
pub mod routing_table;
pub mod server;
pub mod url;

pub use config::DiscoveryConfig;
pub use error::{DiscoveryError, DiscoveryResult};
pub use messages::{Endpoint, Message, NodeInfo};
pub use peer::Peer;
pub use routing_table::{AlwaysAlive, LivenessProbe, RoutingEntry, RoutingTable};
pub use server::{DiscoveryEvent, DiscoveryServer};
pub use url::EnodeUrl;
