//! Plugin chain configuration builder.
//!
//! Pure transformation of instance parameters into the chain executed by the
//! plugin runtime:
//!
//! ```text
//! bridge ──► firewall ──► [bandwidth] ──► dnsname
//! ```
//!
//! The bandwidth plugin is only present when a nonzero rate was requested.

mod types;

pub use types::*;

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::json;

use crate::error::{NetworkError, Result};
use crate::subnet::SubnetLease;
use crate::types::NetworkParams;

/// Prefix of workload network bridge names.
pub const BRIDGE_PREFIX: &str = "br-";

/// Prefix of per-instance firewall admin chains.
pub const ADMIN_CHAIN_PREFIX: &str = "INSTANCE_";

/// Interface name inside the instance namespace.
pub const INSTANCE_IF_NAME: &str = "eth0";

/// Burst size in bytes for shaped interfaces, sized relative to the MTU.
pub const BURST_LEN: u64 = 12800;

const DEFAULT_PROTOCOL: &str = "tcp";

const DEFAULT_ROUTE: &str = "0.0.0.0/0";

/// Bridge interface name of a workload network.
pub fn bridge_name(network_id: &str) -> String {
    format!("{}{}", BRIDGE_PREFIX, network_id)
}

/// Build the full chain for attaching `instance_id` to `network_id`.
///
/// `network_dir` is the root the address allocator keeps its per-network
/// reservations in.
pub fn build_network_config(
    cni_version: &str,
    network_dir: &Path,
    instance_id: &str,
    network_id: &str,
    lease: &SubnetLease,
    params: &NetworkParams,
) -> Result<NetworkConfigList> {
    let mut plugins = vec![
        bridge_plugin(network_dir, network_id, lease),
        firewall_plugin(instance_id, &params.exposed_ports, &params.allowed_connections)?,
    ];

    if let Some(bandwidth) = bandwidth_plugin(params.ingress_kbit, params.egress_kbit) {
        plugins.push(bandwidth);
    }

    plugins.push(dns_plugin(network_id));

    Ok(NetworkConfigList {
        name: network_id.to_string(),
        cni_version: cni_version.to_string(),
        plugins,
    })
}

/// Bridge plugin with a host-local allocator seeded from the lease.
pub fn bridge_plugin(network_dir: &Path, network_id: &str, lease: &SubnetLease) -> PluginConfig {
    PluginConfig::Bridge(BridgeConfig {
        bridge: bridge_name(network_id),
        is_gateway: true,
        ip_masq: true,
        hairpin_mode: true,
        ipam: IpamConfig {
            kind: "host-local".to_string(),
            data_dir: network_dir.to_path_buf(),
            range: IpRange {
                range_start: lease.range_start.into(),
                range_end: lease.range_end.into(),
                subnet: lease.subnet,
            },
            routes: vec![Route {
                dst: DEFAULT_ROUTE.to_string(),
            }],
        },
    })
}

/// Firewall plugin with the instance allow-lists.
pub fn firewall_plugin(
    instance_id: &str,
    exposed_ports: &[String],
    allowed_connections: &[String],
) -> Result<PluginConfig> {
    let input_access = exposed_ports
        .iter()
        .map(|entry| parse_exposed_port(entry))
        .collect::<Result<Vec<_>>>()?;

    let output_access = allowed_connections
        .iter()
        .map(|entry| parse_allowed_connection(entry))
        .collect::<Result<Vec<_>>>()?;

    Ok(PluginConfig::Firewall(FirewallConfig {
        uuid: instance_id.to_string(),
        iptables_admin_chain_name: format!("{}{}", ADMIN_CHAIN_PREFIX, instance_id),
        allow_public_connections: true,
        input_access,
        output_access,
    }))
}

/// Parse an exposed port entry of the form `port[/protocol]`.
pub fn parse_exposed_port(entry: &str) -> Result<InputAccess> {
    let parts: Vec<&str> = entry.split('/').collect();

    match parts.as_slice() {
        [port] if is_token(port) => Ok(InputAccess {
            port: port.to_string(),
            protocol: DEFAULT_PROTOCOL.to_string(),
        }),
        [port, protocol] if is_token(port) && is_token(protocol) => Ok(InputAccess {
            port: port.to_string(),
            protocol: protocol.to_string(),
        }),
        _ => Err(NetworkError::InvalidExposedPort(entry.to_string())),
    }
}

/// Parse an allowed connection entry of the form `instanceID/port[/protocol]`.
pub fn parse_allowed_connection(entry: &str) -> Result<OutputAccess> {
    let parts: Vec<&str> = entry.split('/').collect();

    match parts.as_slice() {
        [uuid, port] if is_token(uuid) && is_token(port) => Ok(OutputAccess {
            uuid: uuid.to_string(),
            port: port.to_string(),
            protocol: DEFAULT_PROTOCOL.to_string(),
        }),
        [uuid, port, protocol] if is_token(uuid) && is_token(port) && is_token(protocol) => {
            Ok(OutputAccess {
                uuid: uuid.to_string(),
                port: port.to_string(),
                protocol: protocol.to_string(),
            })
        }
        _ => Err(NetworkError::InvalidAllowedConnection(entry.to_string())),
    }
}

fn is_token(value: &str) -> bool {
    !value.is_empty() && !value.chars().any(char::is_whitespace)
}

/// Bandwidth plugin, or `None` when both directions are unlimited.
pub fn bandwidth_plugin(ingress_kbit: u64, egress_kbit: u64) -> Option<PluginConfig> {
    if ingress_kbit == 0 && egress_kbit == 0 {
        return None;
    }

    let mut bandwidth = BandwidthConfig::default();

    if ingress_kbit > 0 {
        bandwidth.ingress_rate = ingress_kbit.saturating_mul(1000);
        bandwidth.ingress_burst = BURST_LEN;
    }

    if egress_kbit > 0 {
        bandwidth.egress_rate = egress_kbit.saturating_mul(1000);
        bandwidth.egress_burst = BURST_LEN;
    }

    Some(PluginConfig::Bandwidth(bandwidth))
}

/// DNS plugin serving the network's domain.
pub fn dns_plugin(network_id: &str) -> PluginConfig {
    let mut capabilities = BTreeMap::new();
    capabilities.insert("aliases".to_string(), true);

    PluginConfig::Dns(DnsConfig {
        multi_domain: true,
        domain_name: network_id.to_string(),
        capabilities,
    })
}

/// Hostnames an instance advertises in `network_id`.
///
/// Aliases, then the explicit hostname, then `<index>.<subject>.<service>`
/// (and `<subject>.<service>` for index 0) when the identity is complete.
/// Every dotted name is additionally registered under the network domain.
pub fn hostnames(network_id: &str, params: &NetworkParams) -> Vec<String> {
    let mut hosts = params.aliases.clone();

    if !params.hostname.is_empty() {
        hosts.push(params.hostname.clone());
    }

    let ident = &params.ident;
    if !ident.service_id.is_empty() && !ident.subject_id.is_empty() {
        hosts.push(format!("{}.{}.{}", ident.instance, ident.subject_id, ident.service_id));

        if ident.instance == 0 {
            hosts.push(format!("{}.{}", ident.subject_id, ident.service_id));
        }
    }

    let qualified: Vec<String> = hosts
        .iter()
        .filter(|host| host.contains('.'))
        .map(|host| format!("{}.{}", host, network_id))
        .collect();

    hosts.extend(qualified);
    hosts
}

/// Runtime parameters for adding an instance.
pub fn runtime_conf(netns: &Path, instance_id: &str, network_id: &str, hosts: &[String]) -> RuntimeConf {
    let mut rt = RuntimeConf {
        container_id: instance_id.to_string(),
        netns: netns.to_path_buf(),
        if_name: INSTANCE_IF_NAME.to_string(),
        args: vec![
            ("IgnoreUnknown".to_string(), "1".to_string()),
            ("K8S_POD_NAME".to_string(), instance_id.to_string()),
        ],
        capability_args: serde_json::Map::new(),
    };

    if !hosts.is_empty() {
        let mut aliases = serde_json::Map::new();
        aliases.insert(network_id.to_string(), json!(hosts));
        rt.capability_args
            .insert("aliases".to_string(), serde_json::Value::Object(aliases));
    }

    rt
}

/// Runtime parameters identifying an attachment for cache lookups.
pub fn partial_runtime_conf(netns: &Path, instance_id: &str) -> RuntimeConf {
    RuntimeConf {
        container_id: instance_id.to_string(),
        netns: netns.to_path_buf(),
        if_name: INSTANCE_IF_NAME.to_string(),
        ..Default::default()
    }
}
