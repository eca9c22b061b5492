//! Configuration for the RLPx transport.

use serde::{Deserialize, Serialize};

use super::error::RlpxResult;
use super::message::Capability;

/// Default TCP port for RLPx connections.
pub const DEFAULT_RLPX_PORT: u16 = 30303;

/// Default client identifier sent in Hello.
pub const DEFAULT_CLIENT_ID: &str = concat!("kestrel/v", env!("CARGO_PKG_VERSION"));

/// Default subprotocol advertised and required.
pub const DEFAULT_CAPABILITY: &str = "eth/66";

/// Default maximum number of connections.
pub const DEFAULT_MAX_PEERS: usize = 25;

/// Default time allowed for the auth and Hello exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Default number of dial rounds needed to cover every verified peer.
pub const DEFAULT_DIAL_SELECTOR_MODULUS: u64 = 10;

const fn default_rlpx_port() -> u16 {
    DEFAULT_RLPX_PORT
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

fn default_capabilities() -> Vec<String> {
    vec![DEFAULT_CAPABILITY.to_string()]
}

fn default_required_capability() -> Option<String> {
    Some(DEFAULT_CAPABILITY.to_string())
}

const fn default_max_peers() -> usize {
    DEFAULT_MAX_PEERS
}

const fn default_handshake_timeout_secs() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_SECS
}

const fn default_dial_selector_modulus() -> u64 {
    DEFAULT_DIAL_SELECTOR_MODULUS
}

/// Configuration for the RLPx transport.
#[derive(Debug, Clone, clap::Args, Serialize, Deserialize)]
pub struct RlpxConfig {
    /// TCP port for RLPx connections, advertised through discovery.
    #[clap(name = "rlpx-port", long, default_value_t = default_rlpx_port())]
    #[serde(default = "default_rlpx_port")]
    pub port: u16,

    /// Bind address for the RLPx TCP listener.
    ///
    /// If not specified, binds to 0.0.0.0 on the RLPx port.
    #[clap(name = "rlpx-bind-address", long)]
    #[serde(default)]
    pub bind_address: Option<String>,

    /// Client identifier sent in Hello.
    #[clap(name = "client-id", long, default_value_t = default_client_id())]
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Subprotocols advertised in Hello, as <name>/<version>.
    #[clap(name = "capability", long, default_values_t = default_capabilities())]
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,

    /// Subprotocol a peer must advertise to stay connected.
    #[clap(name = "required-capability", long, default_value = DEFAULT_CAPABILITY)]
    #[serde(default = "default_required_capability")]
    pub required_capability: Option<String>,

    /// Maximum number of RLPx connections.
    #[clap(name = "max-peers", long, default_value_t = default_max_peers())]
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Seconds a connection may take to exchange Hello.
    #[clap(name = "handshake-timeout", long, default_value_t = default_handshake_timeout_secs())]
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Verified peers are dialed when their identity modulo this value
    /// matches the current round.
    #[clap(name = "dial-selector-modulus", long, default_value_t = default_dial_selector_modulus())]
    #[serde(default = "default_dial_selector_modulus")]
    pub dial_selector_modulus: u64,
}

impl Default for RlpxConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_RLPX_PORT,
            bind_address: None,
            client_id: default_client_id(),
            capabilities: default_capabilities(),
            required_capability: default_required_capability(),
            max_peers: DEFAULT_MAX_PEERS,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            dial_selector_modulus: DEFAULT_DIAL_SELECTOR_MODULUS,
        }
    }
}

impl RlpxConfig {
    /// Get the bind address for the TCP listener.
    pub fn get_bind_address(&self) -> String {
        self.bind_address
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", self.port))
    }

    /// Parsed advertised capabilities.
    pub fn parse_capabilities(&self) -> RlpxResult<Vec<Capability>> {
        self.capabilities.iter().map(|s| s.parse()).collect()
    }

    /// Parsed required capability, `None` to accept any peer.
    pub fn parse_required_capability(&self) -> RlpxResult<Option<Capability>> {
        self.required_capability
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .transpose()
    }
}
