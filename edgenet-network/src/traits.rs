//! Capabilities the network manager is built on.
//!
//! Every host-facing operation goes through one of these traits so the
//! orchestrator can be constructed with real implementations (see
//! [`crate::linux`]) or in-memory ones (see [`crate::mock`]).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::error::Result;
use crate::plugins::{AddResult, NetworkConfigList, RuntimeConf};
use crate::traffic::TrafficRecord;
use crate::types::TrafficDirection;

/// Executes plugin chains.
#[async_trait]
pub trait PluginRuntime: Send + Sync {
    /// Check that every plugin of the chain is available and accepts its config.
    async fn validate(&self, list: &NetworkConfigList) -> Result<()>;

    /// Run the chain's add operation.
    async fn add(&self, list: &NetworkConfigList, rt: &RuntimeConf) -> Result<AddResult>;

    /// Run the chain's delete operation.
    async fn del(&self, list: &NetworkConfigList, rt: &RuntimeConf) -> Result<()>;

    /// Look up the exact chain and runtime parameters used when the
    /// attachment was added.
    ///
    /// Only the chain name and the container ID / interface of `rt` are
    /// meaningful. Returns `None` when the runtime has no record of the
    /// attachment.
    async fn cached_config(
        &self,
        list: &NetworkConfigList,
        rt: &RuntimeConf,
    ) -> Result<Option<(Vec<u8>, RuntimeConf)>>;
}

/// Creates and destroys named network namespaces.
#[async_trait]
pub trait NamespaceManager: Send + Sync {
    /// Path of the namespace of `instance_id`.
    fn path(&self, instance_id: &str) -> PathBuf;

    /// Create the namespace; fails if it already exists.
    async fn create(&self, instance_id: &str) -> Result<()>;

    /// Destroy the namespace; a missing namespace is not an error.
    async fn destroy(&self, instance_id: &str) -> Result<()>;
}

/// Host network state outside of the plugin chain.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// Subnet configured on an existing bridge, or `None` if the bridge
    /// does not exist or has no IPv4 address.
    async fn bridge_subnet(&self, bridge: &str) -> Result<Option<Ipv4Net>>;

    /// Remove a bridge; a missing bridge is not an error.
    async fn remove_bridge(&self, bridge: &str) -> Result<()>;
}

/// Accounting chains of the host firewall.
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    /// Create an empty accounting chain; an existing chain is kept.
    async fn create_chain(&self, chain: &str) -> Result<()>;

    /// Unhook and remove a chain; a missing chain is not an error.
    async fn delete_chain(&self, chain: &str) -> Result<()>;

    /// Route traffic through `chain`.
    ///
    /// With `address` set only traffic to (input) or from (output) that
    /// address is counted, otherwise all host traffic in that direction.
    async fn attach_accounting(
        &self,
        chain: &str,
        direction: TrafficDirection,
        address: Option<&str>,
    ) -> Result<()>;

    /// Bytes counted by `chain`, or `None` if the chain no longer exists.
    async fn read_counter(&self, chain: &str) -> Result<Option<u64>>;

    /// Install (`true`) or remove (`false`) the drop rule of `chain`.
    async fn set_drop(&self, chain: &str, enabled: bool) -> Result<()>;
}

/// Persists traffic counters across restarts.
#[async_trait]
pub trait TrafficStore: Send + Sync {
    /// Load the record of `chain`, if one was saved.
    async fn load(&self, chain: &str) -> Result<Option<TrafficRecord>>;

    /// Save the record of `chain`.
    async fn save(&self, chain: &str, record: &TrafficRecord) -> Result<()>;
}

/// The capability set a [`crate::NetworkManager`] is constructed with.
#[derive(Clone)]
pub struct NetworkBackends {
    pub runtime: Arc<dyn PluginRuntime>,
    pub namespaces: Arc<dyn NamespaceManager>,
    pub host: Arc<dyn HostNetwork>,
    pub firewall: Arc<dyn FirewallBackend>,
}
