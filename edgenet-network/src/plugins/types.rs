//! Plugin chain wire types.
//!
//! These follow the CNI JSON conventions: every plugin configuration carries
//! a `type` discriminator naming the plugin binary, keys are camelCase.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// An ordered plugin chain for one workload network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfigList {
    /// Network name (the workload network ID)
    pub name: String,
    /// CNI version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Plugins in execution order
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

impl NetworkConfigList {
    /// A chain with only name and version, used to look up cached configs.
    pub fn partial(name: &str, cni_version: &str) -> Self {
        Self {
            name: name.to_string(),
            cni_version: cni_version.to_string(),
            plugins: Vec::new(),
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a chain from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// The bridge plugin of the chain, if present.
    pub fn bridge(&self) -> Option<&BridgeConfig> {
        self.plugins.iter().find_map(|plugin| match plugin {
            PluginConfig::Bridge(bridge) => Some(bridge),
            _ => None,
        })
    }

    /// The firewall plugin of the chain, if present.
    pub fn firewall(&self) -> Option<&FirewallConfig> {
        self.plugins.iter().find_map(|plugin| match plugin {
            PluginConfig::Firewall(firewall) => Some(firewall),
            _ => None,
        })
    }

    /// The bandwidth plugin of the chain, if present.
    pub fn bandwidth(&self) -> Option<&BandwidthConfig> {
        self.plugins.iter().find_map(|plugin| match plugin {
            PluginConfig::Bandwidth(bandwidth) => Some(bandwidth),
            _ => None,
        })
    }

    /// The DNS plugin of the chain, if present.
    pub fn dns(&self) -> Option<&DnsConfig> {
        self.plugins.iter().find_map(|plugin| match plugin {
            PluginConfig::Dns(dns) => Some(dns),
            _ => None,
        })
    }
}

/// One plugin configuration of a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PluginConfig {
    #[serde(rename = "bridge")]
    Bridge(BridgeConfig),
    #[serde(rename = "aos-firewall")]
    Firewall(FirewallConfig),
    #[serde(rename = "bandwidth")]
    Bandwidth(BandwidthConfig),
    #[serde(rename = "dnsname")]
    Dns(DnsConfig),
}

impl PluginConfig {
    /// Plugin binary name.
    pub fn plugin_type(&self) -> &'static str {
        match self {
            PluginConfig::Bridge(_) => "bridge",
            PluginConfig::Firewall(_) => "aos-firewall",
            PluginConfig::Bandwidth(_) => "bandwidth",
            PluginConfig::Dns(_) => "dnsname",
        }
    }
}

/// Bridge plugin configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Bridge interface name
    pub bridge: String,
    /// Assign the gateway address to the bridge
    pub is_gateway: bool,
    /// Masquerade traffic leaving the subnet
    pub ip_masq: bool,
    /// Allow traffic to hairpin back through the bridge
    pub hairpin_mode: bool,
    /// Address allocator
    pub ipam: IpamConfig,
}

/// host-local address allocator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamConfig {
    /// Allocator plugin name
    #[serde(rename = "type")]
    pub kind: String,
    /// Directory the allocator keeps reservations in
    pub data_dir: PathBuf,
    /// Address range handed out
    pub range: IpRange,
    /// Routes installed in the instance namespace
    #[serde(default)]
    pub routes: Vec<Route>,
}

/// Address range of the allocator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpRange {
    pub range_start: IpAddr,
    pub range_end: IpAddr,
    pub subnet: Ipv4Net,
}

/// A route installed in the instance namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub dst: String,
}

/// Firewall plugin configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallConfig {
    /// Instance ID
    pub uuid: String,
    /// Admin chain holding the instance rules
    pub iptables_admin_chain_name: String,
    /// Allow connections to public addresses
    pub allow_public_connections: bool,
    /// Inbound allow-list
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_access: Vec<InputAccess>,
    /// Outbound allow-list
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_access: Vec<OutputAccess>,
}

/// Inbound allow-list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputAccess {
    pub port: String,
    pub protocol: String,
}

/// Outbound allow-list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputAccess {
    /// Peer instance ID
    pub uuid: String,
    pub port: String,
    pub protocol: String,
}

/// Bandwidth plugin configuration. Rates are bits per second, bursts bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthConfig {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ingress_rate: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ingress_burst: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub egress_rate: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub egress_burst: u64,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// DNS plugin configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsConfig {
    /// Serve several domains from one resolver
    #[serde(default)]
    pub multi_domain: bool,
    /// Domain of this network
    pub domain_name: String,
    /// Capabilities requested from the runtime
    #[serde(default)]
    pub capabilities: BTreeMap<String, bool>,
}

/// Per-invocation runtime parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConf {
    /// Container ID (the instance ID)
    pub container_id: String,
    /// Network namespace path
    pub netns: PathBuf,
    /// Interface name inside the namespace
    pub if_name: String,
    /// Plugin arguments
    #[serde(default)]
    pub args: Vec<(String, String)>,
    /// Capability arguments, e.g. DNS aliases
    #[serde(default)]
    pub capability_args: serde_json::Map<String, serde_json::Value>,
}

/// Result of a successful chain add.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddResult {
    /// Addresses assigned to the instance
    #[serde(default)]
    pub ips: Vec<IpConfig>,
    /// DNS settings reported by the chain
    #[serde(default)]
    pub dns: DnsResult,
}

impl AddResult {
    /// The first assigned address.
    pub fn primary_address(&self) -> Option<IpAddr> {
        self.ips.first().map(|ip| ip.address.addr())
    }
}

/// An assigned address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpConfig {
    pub address: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

/// DNS settings reported by the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsResult {
    #[serde(default)]
    pub nameservers: Vec<String>,
}
