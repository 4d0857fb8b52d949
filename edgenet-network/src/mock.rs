//! In-memory capability implementations for testing and development.
//!
//! Every mock keeps its state behind a lock and exposes inspection and
//! failure-injection helpers, so the orchestrator can be exercised without
//! root privileges, plugin binaries or iptables.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use tracing::{debug, info, instrument};

use crate::error::{NetworkError, Result};
use crate::netns::netns_path;
use crate::plugins::{AddResult, DnsResult, IpConfig, NetworkConfigList, RuntimeConf};
use crate::traffic::TrafficRecord;
use crate::traits::{FirewallBackend, HostNetwork, NamespaceManager, NetworkBackends, PluginRuntime, TrafficStore};
use crate::types::TrafficDirection;

fn poisoned() -> NetworkError {
    NetworkError::Internal("Lock poisoned".to_string())
}

// =============================================================================
// Plugin runtime
// =============================================================================

/// Plugin runtime operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeOp {
    Validate,
    Add,
    Del,
    CachedConfig,
}

struct MockAttachment {
    config: Vec<u8>,
    rt: RuntimeConf,
}

#[derive(Default)]
struct RuntimeState {
    /// (network, container) → attachment
    attachments: HashMap<(String, String), MockAttachment>,
    /// Next host offset per network
    next_host: HashMap<String, u32>,
    failures: HashSet<RuntimeOp>,
    nameservers: Vec<String>,
    omit_address: bool,
    add_delay: Option<Duration>,
    add_calls: usize,
    del_calls: usize,
}

/// Plugin runtime that hands out sequential addresses from the bridge
/// allocator range and remembers every chain it added.
#[derive(Default)]
pub struct MockPluginRuntime {
    state: RwLock<RuntimeState>,
}

impl MockPluginRuntime {
    pub fn new() -> Self {
        info!("Creating mock plugin runtime");
        Self::default()
    }

    /// Make `op` fail until [`MockPluginRuntime::clear_failures`].
    pub fn fail_on(&self, op: RuntimeOp) {
        if let Ok(mut state) = self.state.write() {
            state.failures.insert(op);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state.write() {
            state.failures.clear();
        }
    }

    /// Report `nameservers` in add results.
    pub fn set_nameservers(&self, nameservers: Vec<String>) {
        if let Ok(mut state) = self.state.write() {
            state.nameservers = nameservers;
        }
    }

    /// Succeed adds without reporting an address.
    pub fn omit_address(&self, omit: bool) {
        if let Ok(mut state) = self.state.write() {
            state.omit_address = omit;
        }
    }

    /// Sleep for `delay` inside every add.
    pub fn set_add_delay(&self, delay: Duration) {
        if let Ok(mut state) = self.state.write() {
            state.add_delay = Some(delay);
        }
    }

    /// Whether the runtime holds an attachment of the pair.
    pub fn is_attached(&self, network_id: &str, instance_id: &str) -> bool {
        self.state
            .read()
            .map(|state| {
                state
                    .attachments
                    .contains_key(&(network_id.to_string(), instance_id.to_string()))
            })
            .unwrap_or(false)
    }

    /// Number of live attachments.
    pub fn attachment_count(&self) -> usize {
        self.state.read().map(|state| state.attachments.len()).unwrap_or(0)
    }

    /// Chain used for the attachment of a pair.
    pub fn config_of(&self, network_id: &str, instance_id: &str) -> Option<NetworkConfigList> {
        let state = self.state.read().ok()?;
        let attachment = state
            .attachments
            .get(&(network_id.to_string(), instance_id.to_string()))?;
        NetworkConfigList::from_bytes(&attachment.config).ok()
    }

    /// Runtime parameters used for the attachment of a pair.
    pub fn runtime_of(&self, network_id: &str, instance_id: &str) -> Option<RuntimeConf> {
        let state = self.state.read().ok()?;
        state
            .attachments
            .get(&(network_id.to_string(), instance_id.to_string()))
            .map(|attachment| attachment.rt.clone())
    }

    pub fn add_calls(&self) -> usize {
        self.state.read().map(|state| state.add_calls).unwrap_or(0)
    }

    pub fn del_calls(&self) -> usize {
        self.state.read().map(|state| state.del_calls).unwrap_or(0)
    }

    fn check(&self, op: RuntimeOp, operation: &'static str) -> Result<()> {
        let state = self.state.read().map_err(|_| poisoned())?;
        if state.failures.contains(&op) {
            return Err(NetworkError::Plugin {
                operation,
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

/// Address `offset` hosts into the allocator range of `list`.
fn next_address(list: &NetworkConfigList, offset: u32) -> Result<IpNet> {
    let bridge = list
        .bridge()
        .ok_or_else(|| NetworkError::Plugin {
            operation: "add",
            reason: "chain has no bridge plugin".to_string(),
        })?;

    let start = match bridge.ipam.range.range_start {
        IpAddr::V4(start) => start,
        IpAddr::V6(_) => {
            return Err(NetworkError::Plugin {
                operation: "add",
                reason: "IPv6 ranges are not supported".to_string(),
            })
        }
    };

    let address = Ipv4Addr::from(u32::from(start) + offset);
    let subnet = bridge.ipam.range.subnet;
    if !subnet.contains(&address) {
        return Err(NetworkError::Plugin {
            operation: "add",
            reason: format!("range of {} is exhausted", subnet),
        });
    }

    Ipv4Net::new(address, subnet.prefix_len())
        .map(IpNet::V4)
        .map_err(|e| NetworkError::Internal(e.to_string()))
}

#[async_trait]
impl PluginRuntime for MockPluginRuntime {
    async fn validate(&self, list: &NetworkConfigList) -> Result<()> {
        self.check(RuntimeOp::Validate, "validate")?;

        if list.plugins.is_empty() {
            return Err(NetworkError::Plugin {
                operation: "validate",
                reason: "empty plugin chain".to_string(),
            });
        }

        Ok(())
    }

    #[instrument(skip(self, list, rt), fields(network = %list.name, container_id = %rt.container_id))]
    async fn add(&self, list: &NetworkConfigList, rt: &RuntimeConf) -> Result<AddResult> {
        let delay = self.state.read().map_err(|_| poisoned())?.add_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.check(RuntimeOp::Add, "add")?;

        let mut state = self.state.write().map_err(|_| poisoned())?;
        state.add_calls += 1;

        let key = (list.name.clone(), rt.container_id.clone());
        if state.attachments.contains_key(&key) {
            return Err(NetworkError::Plugin {
                operation: "add",
                reason: format!("{} is already attached to {}", rt.container_id, list.name),
            });
        }

        let offset = state.next_host.get(&list.name).copied().unwrap_or(0);
        let address = next_address(list, offset)?;
        let gateway = list
            .bridge()
            .and_then(|bridge| bridge.ipam.range.subnet.hosts().next())
            .map(IpAddr::V4);

        state.next_host.insert(list.name.clone(), offset + 1);
        state.attachments.insert(
            key,
            MockAttachment {
                config: list.to_bytes()?,
                rt: rt.clone(),
            },
        );

        debug!(address = %address, "Mock attachment added");

        let ips = if state.omit_address {
            Vec::new()
        } else {
            vec![IpConfig { address, gateway }]
        };

        Ok(AddResult {
            ips,
            dns: DnsResult {
                nameservers: state.nameservers.clone(),
            },
        })
    }

    #[instrument(skip(self, list, rt), fields(network = %list.name, container_id = %rt.container_id))]
    async fn del(&self, list: &NetworkConfigList, rt: &RuntimeConf) -> Result<()> {
        self.check(RuntimeOp::Del, "del")?;

        let mut state = self.state.write().map_err(|_| poisoned())?;
        state.del_calls += 1;
        state
            .attachments
            .remove(&(list.name.clone(), rt.container_id.clone()));

        debug!("Mock attachment deleted");
        Ok(())
    }

    async fn cached_config(
        &self,
        list: &NetworkConfigList,
        rt: &RuntimeConf,
    ) -> Result<Option<(Vec<u8>, RuntimeConf)>> {
        self.check(RuntimeOp::CachedConfig, "cached config lookup")?;

        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state
            .attachments
            .get(&(list.name.clone(), rt.container_id.clone()))
            .map(|attachment| (attachment.config.clone(), attachment.rt.clone())))
    }
}

// =============================================================================
// Namespaces
// =============================================================================

/// Namespace manager tracking names in memory.
pub struct MockNamespaces {
    dir: PathBuf,
    namespaces: RwLock<HashSet<String>>,
    fail_create: RwLock<bool>,
    fail_destroy: RwLock<bool>,
}

impl MockNamespaces {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            namespaces: RwLock::new(HashSet::new()),
            fail_create: RwLock::new(false),
            fail_destroy: RwLock::new(false),
        }
    }

    pub fn fail_create(&self, fail: bool) {
        if let Ok(mut flag) = self.fail_create.write() {
            *flag = fail;
        }
    }

    pub fn fail_destroy(&self, fail: bool) {
        if let Ok(mut flag) = self.fail_destroy.write() {
            *flag = fail;
        }
    }

    pub fn exists(&self, instance_id: &str) -> bool {
        self.namespaces
            .read()
            .map(|namespaces| namespaces.contains(instance_id))
            .unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.namespaces.read().map(|namespaces| namespaces.len()).unwrap_or(0)
    }
}

#[async_trait]
impl NamespaceManager for MockNamespaces {
    fn path(&self, instance_id: &str) -> PathBuf {
        netns_path(&self.dir, instance_id)
    }

    async fn create(&self, instance_id: &str) -> Result<()> {
        if self.fail_create.read().map(|flag| *flag).unwrap_or(false) {
            return Err(NetworkError::Namespace {
                instance_id: instance_id.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let mut namespaces = self.namespaces.write().map_err(|_| poisoned())?;
        if !namespaces.insert(instance_id.to_string()) {
            return Err(NetworkError::NamespaceExists(instance_id.to_string()));
        }

        Ok(())
    }

    async fn destroy(&self, instance_id: &str) -> Result<()> {
        if self.fail_destroy.read().map(|flag| *flag).unwrap_or(false) {
            return Err(NetworkError::Namespace {
                instance_id: instance_id.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        self.namespaces
            .write()
            .map_err(|_| poisoned())?
            .remove(instance_id);

        Ok(())
    }
}

// =============================================================================
// Host network
// =============================================================================

/// Bridges known to the host.
#[derive(Default)]
pub struct MockHostNetwork {
    bridges: RwLock<HashMap<String, Ipv4Net>>,
    removed: RwLock<Vec<String>>,
    remove_delay: RwLock<Option<Duration>>,
}

impl MockHostNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend a bridge with `subnet` survived from a previous run.
    pub fn add_bridge(&self, bridge: &str, subnet: Ipv4Net) {
        if let Ok(mut bridges) = self.bridges.write() {
            bridges.insert(bridge.to_string(), subnet);
        }
    }

    pub fn has_bridge(&self, bridge: &str) -> bool {
        self.bridges
            .read()
            .map(|bridges| bridges.contains_key(bridge))
            .unwrap_or(false)
    }

    /// Make every bridge removal take `delay`.
    pub fn set_remove_delay(&self, delay: Duration) {
        if let Ok(mut remove_delay) = self.remove_delay.write() {
            *remove_delay = Some(delay);
        }
    }

    /// Bridges removed so far, in order.
    pub fn removed(&self) -> Vec<String> {
        self.removed.read().map(|removed| removed.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl HostNetwork for MockHostNetwork {
    async fn bridge_subnet(&self, bridge: &str) -> Result<Option<Ipv4Net>> {
        Ok(self.bridges.read().map_err(|_| poisoned())?.get(bridge).copied())
    }

    async fn remove_bridge(&self, bridge: &str) -> Result<()> {
        let delay = *self.remove_delay.read().map_err(|_| poisoned())?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.bridges.write().map_err(|_| poisoned())?.remove(bridge);
        self.removed
            .write()
            .map_err(|_| poisoned())?
            .push(bridge.to_string());
        Ok(())
    }
}

// =============================================================================
// Firewall
// =============================================================================

#[derive(Debug, Default)]
struct MockChain {
    counter: u64,
    dropping: bool,
    accounting: Vec<(TrafficDirection, Option<String>)>,
}

/// Accounting chains with settable counters.
#[derive(Default)]
pub struct MockFirewall {
    chains: RwLock<HashMap<String, MockChain>>,
    fail_create: RwLock<bool>,
}

impl MockFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, fail: bool) {
        if let Ok(mut flag) = self.fail_create.write() {
            *flag = fail;
        }
    }

    pub fn has_chain(&self, chain: &str) -> bool {
        self.chains
            .read()
            .map(|chains| chains.contains_key(chain))
            .unwrap_or(false)
    }

    pub fn chain_count(&self) -> usize {
        self.chains.read().map(|chains| chains.len()).unwrap_or(0)
    }

    pub fn counter(&self, chain: &str) -> Option<u64> {
        self.chains.read().ok()?.get(chain).map(|c| c.counter)
    }

    /// Set the byte counter of an existing chain.
    pub fn set_counter(&self, chain: &str, bytes: u64) {
        if let Ok(mut chains) = self.chains.write() {
            if let Some(c) = chains.get_mut(chain) {
                c.counter = bytes;
            }
        }
    }

    pub fn is_dropping(&self, chain: &str) -> bool {
        self.chains
            .read()
            .ok()
            .and_then(|chains| chains.get(chain).map(|c| c.dropping))
            .unwrap_or(false)
    }

    /// Address the chain accounts for, `None` for host-wide chains.
    pub fn accounted_address(&self, chain: &str) -> Option<String> {
        self.chains
            .read()
            .ok()?
            .get(chain)?
            .accounting
            .first()
            .and_then(|(_, address)| address.clone())
    }

    /// Drop a chain behind the monitor's back.
    pub fn remove_chain(&self, chain: &str) {
        if let Ok(mut chains) = self.chains.write() {
            chains.remove(chain);
        }
    }
}

#[async_trait]
impl FirewallBackend for MockFirewall {
    async fn create_chain(&self, chain: &str) -> Result<()> {
        if self.fail_create.read().map(|flag| *flag).unwrap_or(false) {
            return Err(NetworkError::Firewall(format!("injected failure creating {}", chain)));
        }

        self.chains
            .write()
            .map_err(|_| poisoned())?
            .entry(chain.to_string())
            .or_default();
        Ok(())
    }

    async fn delete_chain(&self, chain: &str) -> Result<()> {
        self.chains.write().map_err(|_| poisoned())?.remove(chain);
        Ok(())
    }

    async fn attach_accounting(
        &self,
        chain: &str,
        direction: TrafficDirection,
        address: Option<&str>,
    ) -> Result<()> {
        let mut chains = self.chains.write().map_err(|_| poisoned())?;
        let c = chains
            .get_mut(chain)
            .ok_or_else(|| NetworkError::Firewall(format!("chain {} does not exist", chain)))?;

        c.accounting.push((direction, address.map(str::to_string)));
        Ok(())
    }

    async fn read_counter(&self, chain: &str) -> Result<Option<u64>> {
        Ok(self
            .chains
            .read()
            .map_err(|_| poisoned())?
            .get(chain)
            .map(|c| c.counter))
    }

    async fn set_drop(&self, chain: &str, enabled: bool) -> Result<()> {
        let mut chains = self.chains.write().map_err(|_| poisoned())?;
        let c = chains
            .get_mut(chain)
            .ok_or_else(|| NetworkError::Firewall(format!("chain {} does not exist", chain)))?;

        c.dropping = enabled;
        Ok(())
    }
}

// =============================================================================
// Traffic store
// =============================================================================

/// Traffic store kept in memory.
#[derive(Default)]
pub struct MemoryTrafficStore {
    records: RwLock<HashMap<String, TrafficRecord>>,
}

impl MemoryTrafficStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, chain: &str) -> Option<TrafficRecord> {
        self.records.read().ok()?.get(chain).copied()
    }

    pub fn insert(&self, chain: &str, record: TrafficRecord) {
        if let Ok(mut records) = self.records.write() {
            records.insert(chain.to_string(), record);
        }
    }
}

#[async_trait]
impl TrafficStore for MemoryTrafficStore {
    async fn load(&self, chain: &str) -> Result<Option<TrafficRecord>> {
        Ok(self.records.read().map_err(|_| poisoned())?.get(chain).copied())
    }

    async fn save(&self, chain: &str, record: &TrafficRecord) -> Result<()> {
        self.records
            .write()
            .map_err(|_| poisoned())?
            .insert(chain.to_string(), *record);
        Ok(())
    }
}

// =============================================================================
// Bundle
// =============================================================================

/// A full set of mocks with handles kept for inspection.
pub struct MockNetwork {
    pub runtime: Arc<MockPluginRuntime>,
    pub namespaces: Arc<MockNamespaces>,
    pub host: Arc<MockHostNetwork>,
    pub firewall: Arc<MockFirewall>,
}

impl MockNetwork {
    /// Mocks with namespaces reported under `netns_dir`.
    pub fn new(netns_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime: Arc::new(MockPluginRuntime::new()),
            namespaces: Arc::new(MockNamespaces::new(netns_dir)),
            host: Arc::new(MockHostNetwork::new()),
            firewall: Arc::new(MockFirewall::new()),
        }
    }

    /// The capability set to construct a manager with.
    pub fn backends(&self) -> NetworkBackends {
        NetworkBackends {
            runtime: self.runtime.clone(),
            namespaces: self.namespaces.clone(),
            host: self.host.clone(),
            firewall: self.firewall.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::build_network_config;
    use crate::subnet::SubnetLease;
    use crate::types::NetworkParams;
    use std::path::Path;

    fn chain(network_id: &str, instance_id: &str) -> NetworkConfigList {
        let lease = SubnetLease::new("172.17.0.0/24".parse().unwrap()).unwrap();
        build_network_config(
            "0.4.0",
            Path::new("/tmp/networks"),
            instance_id,
            network_id,
            &lease,
            &NetworkParams::default(),
        )
        .unwrap()
    }

    fn rt(instance_id: &str) -> RuntimeConf {
        crate::plugins::partial_runtime_conf(Path::new("/run/netns/i1"), instance_id)
    }

    #[tokio::test]
    async fn test_runtime_assigns_sequential_addresses() {
        let runtime = MockPluginRuntime::new();

        let first = runtime.add(&chain("n1", "i1"), &rt("i1")).await.unwrap();
        let second = runtime.add(&chain("n1", "i2"), &rt("i2")).await.unwrap();

        assert_eq!(first.primary_address(), Some("172.17.0.2".parse().unwrap()));
        assert_eq!(second.primary_address(), Some("172.17.0.3".parse().unwrap()));
        assert_eq!(runtime.attachment_count(), 2);
    }

    #[tokio::test]
    async fn test_runtime_cached_config_and_del() {
        let runtime = MockPluginRuntime::new();
        let list = chain("n1", "i1");
        runtime.add(&list, &rt("i1")).await.unwrap();

        let partial = NetworkConfigList::partial("n1", "0.4.0");
        let (bytes, cached_rt) = runtime.cached_config(&partial, &rt("i1")).await.unwrap().unwrap();
        assert_eq!(NetworkConfigList::from_bytes(&bytes).unwrap(), list);
        assert_eq!(cached_rt.container_id, "i1");

        runtime.del(&list, &rt("i1")).await.unwrap();
        assert!(runtime.cached_config(&partial, &rt("i1")).await.unwrap().is_none());

        // Unknown attachments are nothing to clean up.
        runtime.del(&list, &rt("i1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_runtime_failure_injection() {
        let runtime = MockPluginRuntime::new();
        runtime.fail_on(RuntimeOp::Add);

        assert!(runtime.add(&chain("n1", "i1"), &rt("i1")).await.is_err());
        assert_eq!(runtime.attachment_count(), 0);

        runtime.clear_failures();
        assert!(runtime.add(&chain("n1", "i1"), &rt("i1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_namespaces() {
        let namespaces = MockNamespaces::new("/run/netns");

        namespaces.create("i1").await.unwrap();
        assert!(matches!(
            namespaces.create("i1").await,
            Err(NetworkError::NamespaceExists(_))
        ));

        namespaces.destroy("i1").await.unwrap();
        namespaces.destroy("i1").await.unwrap();
        assert_eq!(namespaces.count(), 0);
        assert_eq!(namespaces.path("i1"), PathBuf::from("/run/netns/i1"));
    }

    #[tokio::test]
    async fn test_firewall_counters() {
        let firewall = MockFirewall::new();

        firewall.create_chain("EDGENET_SYS_IN").await.unwrap();
        firewall.set_counter("EDGENET_SYS_IN", 10);
        assert_eq!(firewall.read_counter("EDGENET_SYS_IN").await.unwrap(), Some(10));

        firewall.delete_chain("EDGENET_SYS_IN").await.unwrap();
        assert_eq!(firewall.read_counter("EDGENET_SYS_IN").await.unwrap(), None);
        assert!(firewall.set_drop("EDGENET_SYS_IN", true).await.is_err());
    }
}
