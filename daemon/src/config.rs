//! Command line and file configuration of the node.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use kestrel_common::crypto::{KeyPair, PrivateKey, SECRET_KEY_SIZE};
use serde::{Deserialize, Serialize};

use crate::discovery::DiscoveryConfig;
use crate::rlpx::RlpxConfig;

/// Default log filter, overridden by `RUST_LOG`.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default period of the dial task in seconds.
pub const DEFAULT_DIAL_INTERVAL_SECS: u64 = 3;

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

const fn default_dial_interval_secs() -> u64 {
    DEFAULT_DIAL_INTERVAL_SECS
}

#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(name = "kestrel_daemon")]
#[command(version, about = "Kestrel node: UDP peer discovery and RLPx transport")]
pub struct NodeConfig {
    #[command(flatten)]
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[command(flatten)]
    #[serde(default)]
    pub rlpx: RlpxConfig,

    /// Log filter used when RUST_LOG is not set.
    #[clap(name = "log-level", long, default_value_t = default_log_level())]
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Seconds between two dial rounds over verified peers.
    #[clap(name = "dial-interval", long, default_value_t = default_dial_interval_secs())]
    #[serde(default = "default_dial_interval_secs")]
    pub dial_interval_secs: u64,

    /// JSON file to load the configuration from instead of the command line.
    #[clap(name = "config-file", long)]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            rlpx: RlpxConfig::default(),
            log_level: default_log_level(),
            dial_interval_secs: DEFAULT_DIAL_INTERVAL_SECS,
            config_file: None,
        }
    }
}

impl NodeConfig {
    /// Read a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Node identity from the configured secret key, or a fresh one.
    pub fn load_keypair(&self) -> Result<KeyPair> {
        let Some(private_key) = self.discovery.private_key.as_deref() else {
            return Ok(KeyPair::generate());
        };

        let bytes = hex::decode(private_key.trim_start_matches("0x"))
            .context("Node private key is not valid hex")?;
        if bytes.len() != SECRET_KEY_SIZE {
            bail!("Invalid private key length: {} bytes", bytes.len());
        }
        let mut key = [0u8; SECRET_KEY_SIZE];
        key.copy_from_slice(&bytes);
        let private_key = PrivateKey::from_bytes(&key)
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;
        Ok(KeyPair::from_private_key(private_key))
    }
}
