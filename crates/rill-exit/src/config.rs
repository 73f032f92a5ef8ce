//! Exit node configuration.
//!
//! [`ExitConfig`] has a default for every field. [`ExitConfig::load`] layers
//! an optional TOML file and `RILL_EXIT_*` environment variables on top of
//! those defaults; the binary applies command-line overrides last.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::address::Network;
use crate::pagination::DEFAULT_PAGE_LIMIT;
use crate::service::ServiceConfig;

/// Default JSON-RPC port for the exit node.
pub const DEFAULT_RPC_PORT: u16 = 18340;

pub const ENV_PREFIX: &str = "RILL_EXIT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    /// IP address for the JSON-RPC server to bind to.
    pub rpc_bind: String,
    pub rpc_port: u16,
    /// Address network accepted by register requests.
    pub network: Network,
    /// Maximum entries per page.
    pub page_limit: usize,
    /// Chain events buffered per handle before slow listeners lag.
    pub event_capacity: usize,
    /// Derive handles from the sorted account set instead of the raw request.
    pub canonical_handles: bool,
    /// Seconds between regtest blocks mined from the mempool. 0 disables.
    pub block_interval_secs: u64,
    /// Log level filter string (e.g. "info", "rill_exit_lib=debug").
    pub log_level: String,
    /// "text" or "json".
    pub log_format: String,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            rpc_bind: "127.0.0.1".to_string(),
            rpc_port: DEFAULT_RPC_PORT,
            network: Network::Mainnet,
            page_limit: DEFAULT_PAGE_LIMIT,
            event_capacity: 256,
            canonical_handles: false,
            block_interval_secs: 10,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl ExitConfig {
    /// Load from `path` (required if given, otherwise the default location
    /// if it exists) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
            }
            None => {
                if let Some(default) = default_config_path() {
                    builder = builder.add_source(config::File::from(default).required(false));
                }
            }
        }
        builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// Socket address string for the RPC server.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.rpc_bind, self.rpc_port)
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            network: self.network,
            page_limit: self.page_limit.max(1),
            event_capacity: self.event_capacity.max(1),
            canonical_handles: self.canonical_handles,
        }
    }
}

/// `<config dir>/rill/rill-exit.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("rill").join("rill-exit.toml"))
}
