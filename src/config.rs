//! Node configuration
//!
//! Loads the peer-network configuration from a TOML file, applies
//! environment overrides, and validates the result before the network starts.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::version::parse_version;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Directory holding the peer table database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Log filter used when neither FORGE_LOG nor RUST_LOG is set
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_filter: default_log_filter(),
            network: NetworkConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./forge_data")
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// Peer network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address announced to other peers (host[:port])
    pub my_address: Option<String>,
    pub my_platform: String,
    /// Whether other peers may pass our address on
    pub share_my_address: bool,
    pub peer_port: u16,
    pub testnet: bool,
    /// Port reserved for the test network; mainnet peers on it are ignored
    pub testnet_peer_port: u16,
    pub well_known_peers: Vec<String>,
    /// Hosts or announced addresses that are always treated as blacklisted
    pub known_blacklisted_peers: Vec<String>,

    pub min_known_peers: usize,
    pub max_known_peers: usize,
    pub max_connected_public_peers: usize,
    pub max_outbound_connections: usize,
    pub max_inbound_connections: usize,

    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub blacklisting_period_secs: u64,

    pub enable_hallmark_protection: bool,
    /// Minimum weight of a peer to receive pushed blocks/transactions
    pub push_threshold: u64,
    /// Minimum weight of a peer to be asked for more peers
    pub pull_threshold: u64,
    /// Stop fanning out once this many peers acknowledged a broadcast
    pub send_to_peers_limit: usize,
    pub send_transactions_batch_size: usize,

    pub use_persistent_channels: bool,
    /// Upstream HTTP proxy; disables persistent channels when set
    pub proxy: Option<String>,
    pub inbound_idle_timeout_secs: u64,
    pub get_more_peers: bool,
    pub save_peers: bool,
    pub hide_error_details: bool,
    /// Reduced-data mode: refuse requests needing full chain data
    pub light_client: bool,
    pub include_expired_prunable: bool,

    pub max_message_size: usize,
    pub max_request_size: usize,
    pub max_response_size: usize,
    pub min_compress_size: usize,

    /// Minimum peer version accepted, e.g. "1.0.0"
    pub min_version: String,
    /// Our own hallmark (hex), announced in getInfo
    pub hallmark: Option<String>,
    /// Allow loopback/private peers (single-host test networks)
    pub local_test_mode: bool,

    pub connect_interval_secs: u64,
    pub unblacklist_interval_secs: u64,
    pub discovery_interval_secs: u64,
    pub save_interval_secs: u64,

    pub dispatch_workers: usize,
    pub dispatch_queue: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            my_address: None,
            my_platform: "PC".to_string(),
            share_my_address: true,
            peer_port: 7874,
            testnet: false,
            testnet_peer_port: 6874,
            well_known_peers: vec![],
            known_blacklisted_peers: vec![],
            min_known_peers: 1000,
            max_known_peers: 2000,
            max_connected_public_peers: 20,
            max_outbound_connections: 8,
            max_inbound_connections: 2000,
            connect_timeout_ms: 10_000,
            read_timeout_ms: 20_000,
            blacklisting_period_secs: 600,
            enable_hallmark_protection: true,
            push_threshold: 0,
            pull_threshold: 0,
            send_to_peers_limit: 10,
            send_transactions_batch_size: 10,
            use_persistent_channels: true,
            proxy: None,
            inbound_idle_timeout_secs: 900,
            get_more_peers: true,
            save_peers: true,
            hide_error_details: false,
            light_client: false,
            include_expired_prunable: false,
            max_message_size: 10 * 1024 * 1024,
            max_request_size: 1024 * 1024,
            max_response_size: 1024 * 1024,
            min_compress_size: 256,
            min_version: "1.0.0".to_string(),
            hallmark: None,
            local_test_mode: false,
            connect_interval_secs: 20,
            unblacklist_interval_secs: 60,
            discovery_interval_secs: 20,
            save_interval_secs: 300,
            dispatch_workers: 8,
            dispatch_queue: 256,
        }
    }
}

impl NetworkConfig {
    /// Port peers are expected on when an address carries none
    pub fn default_peer_port(&self) -> u16 {
        if self.testnet {
            self.testnet_peer_port
        } else {
            self.peer_port
        }
    }

    pub fn min_version_parts(&self) -> Vec<u32> {
        parse_version(&self.min_version).unwrap_or_else(|| vec![1, 0, 0])
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_known_peers > self.max_known_peers {
            return Err(ConfigError::Invalid(
                "min_known_peers cannot be greater than max_known_peers".to_string(),
            ));
        }
        if self.max_outbound_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_outbound_connections must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        if parse_version(&self.min_version).is_none() {
            return Err(ConfigError::Invalid(format!(
                "min_version is not a dotted numeric version: {}",
                self.min_version
            )));
        }
        if self.max_request_size > self.max_message_size
            || self.max_response_size > self.max_message_size
        {
            return Err(ConfigError::Invalid(
                "max_request_size and max_response_size must not exceed max_message_size"
                    .to_string(),
            ));
        }
        if !self.testnet && self.peer_port == self.testnet_peer_port {
            return Err(ConfigError::Invalid(format!(
                "peer_port {} is reserved for the test network",
                self.peer_port
            )));
        }
        if self.send_transactions_batch_size == 0 || self.send_to_peers_limit == 0 {
            return Err(ConfigError::Invalid(
                "send_transactions_batch_size and send_to_peers_limit must be at least 1"
                    .to_string(),
            ));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("FORGE_MY_ADDRESS") {
            let val = val.trim();
            self.my_address = if val.is_empty() {
                None
            } else {
                Some(val.to_string())
            };
        }
        if let Ok(val) = std::env::var("FORGE_PEER_PORT") {
            if let Ok(port) = val.trim().parse() {
                self.peer_port = port;
            }
        }
        if let Ok(val) = std::env::var("FORGE_TESTNET") {
            self.testnet = env_flag(&val);
        }
        if let Ok(val) = std::env::var("FORGE_LOCAL_TEST_MODE") {
            self.local_test_mode = env_flag(&val);
        }
        if let Ok(val) = std::env::var("FORGE_WELL_KNOWN_PEERS") {
            self.well_known_peers = val
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
}

fn env_flag(val: &str) -> bool {
    val.eq_ignore_ascii_case("true") || val == "1"
}

/// Load the node configuration from TOML, or defaults when `path` is None
pub fn load_node_config(path: Option<&Path>) -> Result<NodeConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            toml::from_str::<NodeConfig>(&content)?
        }
        None => NodeConfig::default(),
    };

    // Treat empty-string addresses as "unset".
    if config
        .network
        .my_address
        .as_deref()
        .is_some_and(|s| s.trim().is_empty())
    {
        config.network.my_address = None;
    }

    config.network.apply_env_overrides();
    config.network.validate()?;

    tracing::info!(
        well_known_peers = config.network.well_known_peers.len(),
        peer_port = config.network.default_peer_port(),
        max_known_peers = config.network.max_known_peers,
        "Loaded node configuration"
    );

    Ok(config)
}
