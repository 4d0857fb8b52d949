//! Configuration for the network manager.

use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;
use serde::Deserialize;

use crate::error::{NetworkError, Result};
use crate::traffic::TrafficPeriod;
use crate::types::HostEntry;

/// Default root for network working state.
pub const DEFAULT_WORKING_DIR: &str = "/var/lib/edgenet";

/// Default directory holding named network namespaces.
pub const DEFAULT_NETNS_DIR: &str = "/run/netns";

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkManagerConfig {
    /// Root working directory; plugin state lives in `<working_dir>/cni`
    pub working_dir: PathBuf,
    /// Directory of named network namespaces
    pub netns_dir: PathBuf,
    /// CNI version written into generated plugin chains
    pub cni_version: String,
    /// Static hosts appended to every generated hosts file
    pub hosts: Vec<HostEntry>,
    /// Subnet pool configuration
    pub subnets: SubnetPoolConfig,
    /// Traffic accounting configuration
    pub traffic: TrafficConfig,
    /// DNS configuration
    pub dns: DnsConfig,
}

impl Default for NetworkManagerConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from(DEFAULT_WORKING_DIR),
            netns_dir: PathBuf::from(DEFAULT_NETNS_DIR),
            cni_version: "0.4.0".to_string(),
            hosts: Vec::new(),
            subnets: SubnetPoolConfig::default(),
            traffic: TrafficConfig::default(),
            dns: DnsConfig::default(),
        }
    }
}

impl NetworkManagerConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path).map_err(|e| {
            NetworkError::InvalidConfig(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: NetworkManagerConfig = serde_yaml::from_str(&content)
            .map_err(|e| NetworkError::InvalidConfig(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.subnets.ranges.is_empty() {
            return Err(NetworkError::InvalidConfig(
                "At least one subnet range is required".to_string(),
            ));
        }

        if !(16..=30).contains(&self.subnets.prefix_len) {
            return Err(NetworkError::InvalidConfig(format!(
                "Subnet prefix length {} is outside 16..=30",
                self.subnets.prefix_len
            )));
        }

        if let Some(range) = self
            .subnets
            .ranges
            .iter()
            .find(|range| range.prefix_len() > self.subnets.prefix_len)
        {
            return Err(NetworkError::InvalidConfig(format!(
                "Subnet range {} is smaller than a /{} subnet",
                range, self.subnets.prefix_len
            )));
        }

        if self.traffic.update_interval_secs == 0 {
            return Err(NetworkError::InvalidConfig(
                "Traffic update interval must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Directory holding plugin caches and per-network state.
    pub fn cni_dir(&self) -> PathBuf {
        self.working_dir.join("cni")
    }

    /// Directory holding one sub-directory per workload network.
    pub fn network_dir(&self) -> PathBuf {
        self.cni_dir().join("networks")
    }
}

/// Subnet pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubnetPoolConfig {
    /// Private ranges subnets are carved from
    pub ranges: Vec<Ipv4Net>,
    /// Prefix length of each workload subnet
    pub prefix_len: u8,
}

impl Default for SubnetPoolConfig {
    fn default() -> Self {
        let ranges = ["172.17.0.0/16", "172.18.0.0/16", "10.10.0.0/16"]
            .iter()
            .filter_map(|range| range.parse().ok())
            .collect();

        Self {
            ranges,
            prefix_len: 24,
        }
    }
}

/// Traffic accounting configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Accounting period
    pub period: TrafficPeriod,
    /// Counter sampling interval in seconds
    pub update_interval_secs: u64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            period: TrafficPeriod::Day,
            update_interval_secs: 60,
        }
    }
}

/// DNS configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Used when neither the runtime nor the caller supplied nameservers
    pub fallback_servers: Vec<String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            fallback_servers: vec!["8.8.8.8".to_string()],
        }
    }
}
