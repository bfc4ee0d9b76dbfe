//! Node configuration file
//!
//! Everything has a default except the gateway URL; a node that only
//! ever syncs via courier may leave even that at its placeholder and
//! simply never reach it.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::NodeError;

/// Default control-server bind address
pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:13276";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Root of all node state; db/, blobs/, and staging/ live under it
    pub data_dir: PathBuf,
    /// Where the local control API listens
    pub control_listen_addr: SocketAddr,
    /// Origin of the public gateway, e.g. `https://gateway.example.com`
    pub gateway_url: String,
    /// Fixed courier docking address, when one exists on this network
    pub courier_addr: Option<SocketAddr>,
    /// Seconds between courier run attempts
    pub courier_interval_secs: u64,
    /// Seconds between expiry sweeps
    pub maintenance_interval_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./portage-data"),
            control_listen_addr: DEFAULT_CONTROL_ADDR
                .parse()
                .unwrap_or_else(|_| unreachable!("default address is valid")),
            gateway_url: "https://gateway.invalid".to_string(),
            courier_addr: None,
            courier_interval_secs: 300,
            maintenance_interval_secs: 3600,
        }
    }
}

impl NodeConfig {
    /// Load from a TOML file; missing keys fall back to defaults
    pub fn load(path: &Path) -> Result<Self, NodeError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| NodeError::Config(e.to_string()))
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db").join("gateway.redb")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }
}
