//! Configuration for the discovery protocol.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Default discovery port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 30303;

/// Default ping timeout in milliseconds.
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 2000;

/// Default refresh period in seconds.
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 6;

/// Default liveness sweep period in milliseconds.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 2000;

/// Default time a timed-out peer stays blacklisted, in seconds.
pub const DEFAULT_BLACKLIST_DURATION_SECS: u64 = 15 * 60;

const fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

const fn default_ping_timeout_ms() -> u64 {
    DEFAULT_PING_TIMEOUT_MS
}

const fn default_refresh_interval_secs() -> u64 {
    DEFAULT_REFRESH_INTERVAL_SECS
}

const fn default_sweep_interval_ms() -> u64 {
    DEFAULT_SWEEP_INTERVAL_MS
}

const fn default_blacklist_duration_secs() -> u64 {
    DEFAULT_BLACKLIST_DURATION_SECS
}

/// Configuration for the discovery protocol.
#[derive(Debug, Clone, clap::Args, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// UDP port for discovery protocol.
    #[clap(name = "discovery-port", long, default_value_t = default_discovery_port())]
    #[serde(default = "default_discovery_port")]
    pub port: u16,

    /// Bind address for discovery UDP socket.
    ///
    /// If not specified, binds to 0.0.0.0 on the discovery port.
    #[clap(name = "discovery-bind-address", long)]
    #[serde(default)]
    pub bind_address: Option<String>,

    /// IP address advertised to other nodes in Ping and Neighbors packets.
    ///
    /// Defaults to the IP of the bound socket.
    #[clap(name = "discovery-advertised-ip", long)]
    #[serde(default)]
    pub advertised_ip: Option<IpAddr>,

    /// secp256k1 secret key for the node identity (hex, 32 bytes).
    ///
    /// If not provided, a new key will be generated on startup.
    #[clap(name = "node-private-key", long, env = "NODE_PRIVATE_KEY")]
    #[serde(default)]
    pub private_key: Option<String>,

    /// Bootstrap nodes to contact on startup.
    ///
    /// Format: enode://<node_id_hex>@<ip>:<port>[?discport=<udp port>]
    #[clap(name = "discovery-bootstrap", long)]
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,

    /// Time a ping may stay unanswered before the peer is dropped.
    #[clap(name = "discovery-ping-timeout-ms", long, default_value_t = default_ping_timeout_ms())]
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Period of the FindNodes refresh task.
    #[clap(name = "discovery-refresh-interval", long, default_value_t = default_refresh_interval_secs())]
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Period of the unanswered-ping sweep.
    #[clap(name = "discovery-sweep-interval-ms", long, default_value_t = default_sweep_interval_ms())]
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// How long a peer dropped by the sweep is ignored.
    #[clap(name = "discovery-blacklist-duration", long, default_value_t = default_blacklist_duration_secs())]
    #[serde(default = "default_blacklist_duration_secs")]
    pub blacklist_duration_secs: u64,

    /// Disable the discovery protocol.
    ///
    /// When disabled, the node will not participate in peer discovery.
    #[clap(name = "disable-discovery", long)]
    #[serde(default)]
    pub disable: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            bind_address: None,
            advertised_ip: None,
            private_key: None,
            bootstrap_nodes: Vec::new(),
            ping_timeout_ms: DEFAULT_PING_TIMEOUT_MS,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            blacklist_duration_secs: DEFAULT_BLACKLIST_DURATION_SECS,
            disable: false,
        }
    }
}

impl DiscoveryConfig {
    /// Get the bind address for the UDP socket.
    pub fn get_bind_address(&self) -> String {
        self.bind_address
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", self.port))
    }

    /// Check if discovery is enabled.
    pub fn is_enabled(&self) -> bool {
        !self.disable
    }
}
