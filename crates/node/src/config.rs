//! Node configuration: JSON file on disk, CLI flags layered on top in `main`.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SLICE_SIZE: u64 = 32 * 1024 * 1024;
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// An indexing server the node may attach to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpEndpoint {
    pub p2p_address: String,
    pub network_address: String,
}

impl std::str::FromStr for SpEndpoint {
    type Err = anyhow::Error;

    /// Parses `p2p_address@host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (p2p, net) = s
            .split_once('@')
            .with_context(|| format!("expected p2p_address@host:port, got {s:?}"))?;
        if p2p.is_empty() || net.is_empty() {
            anyhow::bail!("empty component in indexing server endpoint {s:?}");
        }
        Ok(Self {
            p2p_address: p2p.to_string(),
            network_address: net.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub min_interval_secs: u64,
    pub multiplier: u32,
    pub max_interval_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 30,
            multiplier: 2,
            max_interval_secs: 600,
        }
    }
}

impl BackoffConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub storage_path: String,
    pub max_gb: u64,
    pub listen: String,
    /// Address other nodes use to reach this one.
    pub network_address: String,
    pub sp_list: Vec<SpEndpoint>,
    pub wallet_address: String,
    pub beneficiary_address: String,
    pub slice_size: u64,
    pub max_frame_payload: usize,
    pub heartbeat_interval_secs: u64,
    pub offline_channel_capacity: usize,
    pub receipt_max_age_secs: u64,
    pub node_status_interval_secs: u64,
    /// Transfers with no progress for this long are dropped.
    pub stale_transfer_secs: u64,
    pub sweep_interval_secs: u64,
    pub backoff: BackoffConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            storage_path: "./node-data".to_string(),
            max_gb: 50,
            listen: "0.0.0.0:18081".to_string(),
            network_address: "127.0.0.1:18081".to_string(),
            sp_list: Vec::new(),
            wallet_address: String::new(),
            beneficiary_address: String::new(),
            slice_size: DEFAULT_SLICE_SIZE,
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            heartbeat_interval_secs: 30,
            offline_channel_capacity: 2,
            receipt_max_age_secs: 300,
            node_status_interval_secs: 300,
            stale_transfer_secs: 600,
            sweep_interval_secs: 60,
            backoff: BackoffConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn node_status_interval(&self) -> Duration {
        Duration::from_secs(self.node_status_interval_secs.max(1))
    }

    pub fn stale_transfer_after(&self) -> Duration {
        Duration::from_secs(self.stale_transfer_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Beneficiary falls back to the node's own wallet when unset.
    pub fn beneficiary(&self) -> &str {
        if self.beneficiary_address.is_empty() {
            &self.wallet_address
        } else {
            &self.beneficiary_address
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.slice_size == 0 {
            anyhow::bail!("slice_size must be positive");
        }
        if self.max_frame_payload == 0 {
            anyhow::bail!("max_frame_payload must be positive");
        }
        if self.offline_channel_capacity == 0 {
            anyhow::bail!("offline_channel_capacity must be positive");
        }
        if self.stale_transfer_secs == 0 {
            anyhow::bail!("stale_transfer_secs must be positive");
        }
        if self.backoff.multiplier == 0 || self.backoff.min_interval_secs == 0 {
            anyhow::bail!("backoff interval and multiplier must be positive");
        }
        if self.backoff.max_interval_secs < self.backoff.min_interval_secs {
            anyhow::bail!("backoff max interval is below the min interval");
        }
        Ok(())
    }
}

pub fn load_config(config_path: &Path) -> anyhow::Result<Option<NodeConfig>> {
    if !config_path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read node config {}", config_path.display()))?;
    let cfg: NodeConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse node config {}", config_path.display()))?;
    Ok(Some(cfg))
}

pub fn save_config(config_path: &Path, cfg: &NodeConfig) -> anyhow::Result<()> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_string_pretty(cfg)?;
    fs::write(config_path, raw)
        .with_context(|| format!("failed to write node config {}", config_path.display()))?;
    Ok(())
}

pub fn default_config_path() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("sds").join("node-config.json");
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("sds")
            .join("node-config.json");
    }
    PathBuf::from("node-config.json")
}
