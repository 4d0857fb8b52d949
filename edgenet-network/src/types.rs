//! Core types for instance networking.

use serde::{Deserialize, Serialize};

/// A static `ip hostname` entry for generated hosts files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    /// IP address
    pub ip: String,
    /// Hostname resolved to `ip`
    pub hostname: String,
}

impl HostEntry {
    /// Create a new host entry.
    pub fn new(ip: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            hostname: hostname.into(),
        }
    }
}

/// Identity of a service instance as seen by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceIdent {
    /// Service identifier
    pub service_id: String,
    /// Subject identifier
    pub subject_id: String,
    /// Instance index within service/subject
    pub instance: u64,
}

/// Parameters for attaching an instance to a workload network.
///
/// Built with the `with_*` helpers:
///
/// ```rust,ignore
/// let params = NetworkParams::default()
///     .with_hostname("web")
///     .with_exposed_ports(["80/tcp"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct NetworkParams {
    /// Service/subject/index identity used for generated hostnames
    pub ident: InstanceIdent,
    /// Explicit hostname
    pub hostname: String,
    /// Additional DNS aliases
    pub aliases: Vec<String>,
    /// Ingress rate limit in kbit/s (0 = unlimited)
    pub ingress_kbit: u64,
    /// Egress rate limit in kbit/s (0 = unlimited)
    pub egress_kbit: u64,
    /// Inbound allow-list entries, `port[/protocol]`
    pub exposed_ports: Vec<String>,
    /// Outbound allow-list entries, `instanceID/port[/protocol]`
    pub allowed_connections: Vec<String>,
    /// Static host entries for the hosts file
    pub hosts: Vec<HostEntry>,
    /// Additional DNS servers for resolv.conf
    pub dns_servers: Vec<String>,
    /// Where to write the hosts file (skipped if `None`)
    pub hosts_file_path: Option<std::path::PathBuf>,
    /// Where to write resolv.conf (skipped if `None`)
    pub resolv_conf_file_path: Option<std::path::PathBuf>,
    /// Upload cap in bytes per traffic period (0 = none)
    pub upload_limit: u64,
    /// Download cap in bytes per traffic period (0 = none)
    pub download_limit: u64,
}

impl NetworkParams {
    /// Set the service identity.
    pub fn with_ident(mut self, service_id: &str, subject_id: &str, instance: u64) -> Self {
        self.ident = InstanceIdent {
            service_id: service_id.to_string(),
            subject_id: subject_id.to_string(),
            instance,
        };
        self
    }

    /// Set the explicit hostname.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set DNS aliases.
    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    /// Set bandwidth limits in kbit/s.
    pub fn with_bandwidth(mut self, ingress_kbit: u64, egress_kbit: u64) -> Self {
        self.ingress_kbit = ingress_kbit;
        self.egress_kbit = egress_kbit;
        self
    }

    /// Set the inbound allow-list.
    pub fn with_exposed_ports<I, S>(mut self, ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exposed_ports = ports.into_iter().map(Into::into).collect();
        self
    }

    /// Set the outbound allow-list.
    pub fn with_allowed_connections<I, S>(mut self, connections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_connections = connections.into_iter().map(Into::into).collect();
        self
    }

    /// Set per-period traffic caps in bytes.
    pub fn with_traffic_limits(mut self, download_limit: u64, upload_limit: u64) -> Self {
        self.download_limit = download_limit;
        self.upload_limit = upload_limit;
        self
    }
}

/// Traffic counted in the current period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficUsage {
    /// Bytes received
    pub input: u64,
    /// Bytes sent
    pub output: u64,
}

/// Traffic direction of an accounting chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficDirection {
    /// Traffic towards the host or instance
    Input,
    /// Traffic leaving the host or instance
    Output,
}

impl std::fmt::Display for TrafficDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrafficDirection::Input => write!(f, "input"),
            TrafficDirection::Output => write!(f, "output"),
        }
    }
}
