//! Network lifecycle orchestrator.
//!
//! [`NetworkManager`] attaches instances to workload networks and detaches
//! them again. An attach runs
//!
//! ```text
//! reserve ─► claim hostnames ─► namespace ─► build + validate chain ─► add
//!         ─► hosts / resolv.conf ─► traffic monitor ─► finalize
//! ```
//!
//! and every completed step pushes its compensation onto a [`Rollback`], so
//! a failure anywhere leaves neither cache entry, namespace, runtime
//! attachment nor accounting chain behind.
//!
//! ## Locking
//!
//! The cache and the subnet pool share one `RwLock` that is only held for
//! in-memory bookkeeping. Slow work runs unlocked and is serialized per
//! pair by the `Pending` placeholder. Creating and tearing down a whole
//! network (probing the bridge, allocating or releasing the subnet,
//! removing the bridge) goes through a gate of that network only, so a
//! network being torn down is never re-created half way while other
//! networks keep attaching.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ipnet::Ipv4Net;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use edgenet_common::TimedOperation;

use crate::cache::{AttachmentPhase, InstanceCache, Removal};
use crate::config::NetworkManagerConfig;
use crate::dns;
use crate::error::{NetworkError, Result};
use crate::plugins::{self, NetworkConfigList, INSTANCE_IF_NAME};
use crate::rollback::{Rollback, Undo};
use crate::subnet::{SubnetLease, SubnetPool};
use crate::traffic::{TrafficMonitor, TrafficPeriod};
use crate::traits::{NetworkBackends, TrafficStore};
use crate::types::{HostEntry, NetworkParams, TrafficUsage};

/// Files of a network directory that are not instance records.
const HOUSEKEEPING_FILES: &[&str] = &["lock", "last_reserved_ip.0"];

/// Serializes creation and teardown of one network.
type NetworkGate = Arc<tokio::sync::Mutex<()>>;

struct ManagerState {
    cache: InstanceCache,
    subnets: SubnetPool,
    gates: HashMap<String, NetworkGate>,
}

/// Attaches instances to workload networks.
pub struct NetworkManager {
    config: NetworkManagerConfig,
    backends: NetworkBackends,
    state: RwLock<ManagerState>,
    traffic: Option<Arc<TrafficMonitor>>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkManager {
    /// Create the manager.
    ///
    /// Leftovers of a previous run found under the network directory are
    /// torn down first; failures there are logged and never prevent the
    /// manager from starting. Traffic accounting is enabled only when a
    /// store is supplied.
    pub async fn new(
        config: NetworkManagerConfig,
        backends: NetworkBackends,
        traffic_store: Option<Arc<dyn TrafficStore>>,
    ) -> Result<Self> {
        config.validate()?;

        info!(
            working_dir = %config.working_dir.display(),
            ranges = ?config.subnets.ranges,
            prefix_len = config.subnets.prefix_len,
            "Creating network manager"
        );

        let subnets = SubnetPool::new(config.subnets.ranges.clone(), config.subnets.prefix_len);
        let mut manager = Self {
            config,
            backends,
            state: RwLock::new(ManagerState {
                cache: InstanceCache::new(),
                subnets,
                gates: HashMap::new(),
            }),
            traffic: None,
            sampler: Mutex::new(None),
        };

        manager.sweep().await;

        match traffic_store {
            Some(store) => {
                let monitor = Arc::new(TrafficMonitor::new(
                    manager.backends.firewall.clone(),
                    store,
                    &manager.config.traffic,
                ));
                monitor.start().await?;

                manager.sampler = Mutex::new(Some(monitor.start_sampler()));
                manager.traffic = Some(monitor);
            }
            None => warn!("Traffic store not supplied, traffic monitoring is disabled"),
        }

        Ok(manager)
    }

    /// Stop traffic sampling and persist the counters.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<()> {
        info!("Closing network manager");

        let handle = self
            .sampler
            .lock()
            .map_err(|_| NetworkError::Internal("Lock poisoned".to_string()))?
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }

        if let Some(monitor) = &self.traffic {
            monitor.close().await;
        }

        Ok(())
    }

    /// Path of the network namespace of an instance.
    pub fn netns_path(&self, instance_id: &str) -> PathBuf {
        self.backends.namespaces.path(instance_id)
    }

    /// The configuration the manager runs with.
    pub fn config(&self) -> &NetworkManagerConfig {
        &self.config
    }

    // =========================================================================
    // Attach
    // =========================================================================

    /// Attach an instance to a workload network.
    ///
    /// The network and its subnet are created on first use. On failure all
    /// completed steps are undone in reverse order and the error carries
    /// the failing stage.
    #[instrument(skip(self, params))]
    pub async fn add_instance_to_network(
        &self,
        instance_id: &str,
        network_id: &str,
        params: NetworkParams,
    ) -> Result<()> {
        let _timer = TimedOperation::new("add_instance_to_network");

        let attached = self.state()?.cache.contains(network_id, instance_id);
        if attached {
            return Err(already_attached(instance_id, network_id));
        }

        // Reject malformed allow-lists before anything is mutated.
        for port in &params.exposed_ports {
            plugins::parse_exposed_port(port)?;
        }
        for connection in &params.allowed_connections {
            plugins::parse_allowed_connection(connection)?;
        }

        let lease = self.reserve(instance_id, network_id).await?;

        let mut rollback = Rollback::new(instance_id, network_id);
        rollback.push(Undo::Reservation);

        match self
            .attach(instance_id, network_id, &params, &lease, &mut rollback)
            .await
        {
            Ok(address) => {
                rollback.commit();
                info!(
                    instance_id = %instance_id,
                    network_id = %network_id,
                    address = %address,
                    subnet = %lease.subnet,
                    "Instance added to network"
                );
                Ok(())
            }
            Err(e) => {
                warn!(instance_id = %instance_id, network_id = %network_id, error = %e, "Attach failed, rolling back");

                let errors = rollback
                    .unwind(|step| self.compensate(instance_id, network_id, step))
                    .await;
                if !errors.is_empty() {
                    warn!(
                        instance_id = %instance_id,
                        network_id = %network_id,
                        failed_steps = errors.len(),
                        "Rollback finished with errors"
                    );
                }

                Err(e)
            }
        }
    }

    /// Allocate the network subnet and insert the placeholder, atomically.
    async fn reserve(&self, instance_id: &str, network_id: &str) -> Result<SubnetLease> {
        let gate = self.network_gate(network_id)?;
        let _gate = gate.lock().await;

        let allocated = self.state()?.subnets.lease(network_id).is_some();
        let adopt = if !allocated {
            let bridge = plugins::bridge_name(network_id);
            match self.backends.host.bridge_subnet(&bridge).await {
                Ok(subnet) => subnet,
                Err(e) => {
                    warn!(bridge = %bridge, error = %e, "Can't probe existing bridge");
                    None
                }
            }
        } else {
            None
        };

        let mut state = self.state_mut()?;
        state.cache.reserve(network_id, instance_id)?;

        match state.subnets.allocate(network_id, adopt) {
            Ok(lease) => Ok(lease),
            Err(e) => {
                state.cache.remove(network_id, instance_id);
                Err(e)
            }
        }
    }

    /// Steps after the reservation. Returns the assigned address.
    async fn attach(
        &self,
        instance_id: &str,
        network_id: &str,
        params: &NetworkParams,
        lease: &SubnetLease,
        rollback: &mut Rollback,
    ) -> Result<IpAddr> {
        let stage = |name: &'static str| move |e: NetworkError| e.at_stage(instance_id, network_id, name);

        let hosts = plugins::hostnames(network_id, params);
        self.state_mut()
            .and_then(|mut state| state.cache.claim_hostnames(network_id, instance_id, &hosts))
            .map_err(stage("hostname claim"))?;

        self.backends
            .namespaces
            .create(instance_id)
            .await
            .map_err(stage("namespace"))?;
        rollback.push(Undo::Namespace);

        let netns = self.backends.namespaces.path(instance_id);
        let list = plugins::build_network_config(
            &self.config.cni_version,
            &self.config.network_dir(),
            instance_id,
            network_id,
            lease,
            params,
        )
        .map_err(stage("plugin config"))?;
        let rt = plugins::runtime_conf(&netns, instance_id, network_id, &hosts);

        self.backends
            .runtime
            .validate(&list)
            .await
            .map_err(stage("plugin validate"))?;

        rollback.push(Undo::PluginChain {
            list: list.clone(),
            rt: Box::new(rt.clone()),
        });
        let result = self
            .backends
            .runtime
            .add(&list, &rt)
            .await
            .map_err(stage("plugin add"))?;

        let address = result
            .primary_address()
            .ok_or_else(|| NetworkError::NoAddress(instance_id.to_string()))
            .map_err(stage("plugin add"))?;
        debug!(address = %address, nameservers = ?result.dns.nameservers, "Plugin chain added");

        self.write_dns_files(network_id, address, &result.dns.nameservers, params)
            .await
            .map_err(stage("dns files"))?;

        if let Some(monitor) = &self.traffic {
            let started = monitor
                .start_instance(
                    instance_id,
                    &address.to_string(),
                    params.download_limit,
                    params.upload_limit,
                )
                .await
                .map_err(stage("traffic monitor"))?;
            if started {
                rollback.push(Undo::TrafficMonitor);
            }
        }

        self.state_mut()
            .and_then(|mut state| state.cache.finalize(network_id, instance_id, address))
            .map_err(stage("finalize"))?;

        Ok(address)
    }

    async fn write_dns_files(
        &self,
        network_id: &str,
        address: IpAddr,
        nameservers: &[String],
        params: &NetworkParams,
    ) -> Result<()> {
        if let Some(path) = &params.hosts_file_path {
            let hosts: Vec<HostEntry> = self
                .config
                .hosts
                .iter()
                .chain(&params.hosts)
                .cloned()
                .collect();

            dns::write_hosts_file(path, &address.to_string(), network_id, &params.hostname, &hosts).await?;
        }

        if let Some(path) = &params.resolv_conf_file_path {
            dns::write_resolv_conf(
                path,
                nameservers,
                &self.config.dns.fallback_servers,
                &params.dns_servers,
            )
            .await?;
        }

        Ok(())
    }

    async fn compensate(&self, instance_id: &str, network_id: &str, step: Undo) -> Result<()> {
        match step {
            Undo::Reservation => self.drop_attachment(instance_id, network_id).await,
            Undo::Namespace => self.backends.namespaces.destroy(instance_id).await,
            Undo::PluginChain { list, rt } => self.backends.runtime.del(&list, &rt).await,
            Undo::TrafficMonitor => match &self.traffic {
                Some(monitor) => monitor.stop_instance(instance_id).await,
                None => Ok(()),
            },
        }
    }

    // =========================================================================
    // Detach
    // =========================================================================

    /// Detach an instance from a network.
    ///
    /// Detaching a pair that is not attached succeeds without side effects.
    /// The last instance leaving a network tears the network down.
    #[instrument(skip(self))]
    pub async fn remove_instance_from_network(&self, instance_id: &str, network_id: &str) -> Result<()> {
        let _timer = TimedOperation::new("remove_instance_from_network");

        let phase = self.state_mut()?.cache.begin_detach(network_id, instance_id);
        match phase {
            None => {
                debug!("Instance is not in network, nothing to remove");
                return Ok(());
            }
            Some(AttachmentPhase::Pending) => {
                return Err(NetworkError::AttachInProgress {
                    instance_id: instance_id.to_string(),
                    network_id: network_id.to_string(),
                })
            }
            Some(AttachmentPhase::Detaching) => {
                debug!("Instance is already being removed");
                return Ok(());
            }
            Some(AttachmentPhase::Ready) => {}
        }

        if let Err(e) = self.detach(instance_id, network_id).await {
            if let Ok(mut state) = self.state_mut() {
                state.cache.abort_detach(network_id, instance_id);
            }
            return Err(e);
        }

        if let Err(e) = self.drop_attachment(instance_id, network_id).await {
            warn!(error = %e, "Network teardown incomplete");
        }

        info!(instance_id = %instance_id, network_id = %network_id, "Instance removed from network");
        Ok(())
    }

    /// Release the runtime attachment, then the accounting chains.
    ///
    /// Accounting stays in place until the attachment is gone, so a detach
    /// that fails keeps the instance metered and capped.
    async fn detach(&self, instance_id: &str, network_id: &str) -> Result<()> {
        self.release_attachment(instance_id, network_id).await?;

        if let Some(monitor) = &self.traffic {
            if let Err(e) = monitor.stop_instance(instance_id).await {
                warn!(instance_id = %instance_id, error = %e, "Can't remove accounting chains");
            }
        }

        Ok(())
    }

    /// Delete the runtime attachment with the chain it was created with,
    /// then the namespace.
    async fn release_attachment(&self, instance_id: &str, network_id: &str) -> Result<()> {
        let stage = |name: &'static str| move |e: NetworkError| e.at_stage(instance_id, network_id, name);

        let netns = self.backends.namespaces.path(instance_id);
        let partial = NetworkConfigList::partial(network_id, &self.config.cni_version);
        let partial_rt = plugins::partial_runtime_conf(&netns, instance_id);

        let cached = self
            .backends
            .runtime
            .cached_config(&partial, &partial_rt)
            .await
            .map_err(stage("cached config lookup"))?;

        match cached {
            Some((bytes, rt)) => {
                let list = NetworkConfigList::from_bytes(&bytes).map_err(stage("cached config lookup"))?;
                self.backends
                    .runtime
                    .del(&list, &rt)
                    .await
                    .map_err(stage("plugin del"))?;
            }
            None => debug!(
                instance_id = %instance_id,
                network_id = %network_id,
                "No cached plugin chain, nothing to delete"
            ),
        }

        if let Err(e) = self.backends.namespaces.destroy(instance_id).await {
            warn!(instance_id = %instance_id, error = %e, "Can't delete network namespace");
        }

        Ok(())
    }

    /// Remove the cache entry, tearing the network down if it was the last.
    async fn drop_attachment(&self, instance_id: &str, network_id: &str) -> Result<()> {
        let gate = self.network_gate(network_id)?;
        let _gate = gate.lock().await;

        let removal = self.state_mut()?.cache.remove(network_id, instance_id);
        if removal == (Removal::Removed { network_empty: true }) {
            let result = self.clear_network(network_id).await;
            self.retire_gate(network_id, &gate);
            result?;
        }

        Ok(())
    }

    /// The gate of `network_id`, created on first use.
    fn network_gate(&self, network_id: &str) -> Result<NetworkGate> {
        Ok(self
            .state_mut()?
            .gates
            .entry(network_id.to_string())
            .or_default()
            .clone())
    }

    /// Forget the gate of a cleared network unless someone else waits on it.
    ///
    /// `gate` is the caller's handle; with the one in the map that makes two.
    fn retire_gate(&self, network_id: &str, gate: &NetworkGate) {
        if let Ok(mut state) = self.state_mut() {
            if Arc::strong_count(gate) == 2 && !state.cache.has_network(network_id) {
                state.gates.remove(network_id);
            }
        }
    }

    /// Release the subnet, remove the bridge and the network directory.
    ///
    /// Callers hold the gate of the network.
    async fn clear_network(&self, network_id: &str) -> Result<()> {
        let released = self.state_mut()?.subnets.release(network_id);
        if let Some(lease) = released {
            debug!(network_id = %network_id, subnet = %lease.subnet, "Subnet returned to pool");
        }

        let bridge = plugins::bridge_name(network_id);
        let result = self.backends.host.remove_bridge(&bridge).await;
        if let Err(e) = &result {
            warn!(bridge = %bridge, error = %e, "Can't remove bridge");
        }

        let dir = self.config.network_dir().join(network_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %dir.display(), error = %e, "Can't remove network directory"),
        }

        info!(network_id = %network_id, "Network removed");
        result
    }

    // =========================================================================
    // Startup sweep
    // =========================================================================

    /// Tear down every network a previous run left on disk, then clear the
    /// plugin working directory.
    async fn sweep(&self) {
        let network_dir = self.config.network_dir();

        for network_id in list_dir(&network_dir, true).await {
            let instances = read_instance_records(&network_dir.join(&network_id)).await;
            info!(network_id = %network_id, instances = instances.len(), "Removing leftover network");

            for instance_id in instances {
                if let Err(e) = self.release_attachment(&instance_id, &network_id).await {
                    warn!(instance_id = %instance_id, network_id = %network_id, error = %e, "Can't remove leftover instance");
                }
            }

            let gate = match self.network_gate(&network_id) {
                Ok(gate) => gate,
                Err(e) => {
                    warn!(network_id = %network_id, error = %e, "Can't clear leftover network");
                    continue;
                }
            };
            let _gate = gate.lock().await;

            if let Err(e) = self.clear_network(&network_id).await {
                warn!(network_id = %network_id, error = %e, "Can't clear leftover network");
            }
            self.retire_gate(&network_id, &gate);
        }

        let cni_dir = self.config.cni_dir();
        match tokio::fs::remove_dir_all(&cni_dir).await {
            Ok(()) => debug!(path = %cni_dir.display(), "Plugin working directory cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %cni_dir.display(), error = %e, "Can't clear plugin working directory"),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Address of an attached instance.
    pub fn get_instance_ip(&self, instance_id: &str, network_id: &str) -> Result<IpAddr> {
        let state = self.state()?;

        state
            .cache
            .get(network_id, instance_id)
            .and_then(|attachment| attachment.address)
            .ok_or_else(|| NetworkError::NotAttached {
                instance_id: instance_id.to_string(),
                network_id: network_id.to_string(),
            })
    }

    /// Host traffic in the current period.
    pub async fn get_system_traffic(&self) -> Result<TrafficUsage> {
        Ok(self.monitor()?.system_usage().await)
    }

    /// Instance traffic in the current period.
    pub async fn get_instance_traffic(&self, instance_id: &str) -> Result<TrafficUsage> {
        self.monitor()?.instance_usage(instance_id).await
    }

    /// Set the accounting period from its numeric code (0 = minute … 5 = year).
    ///
    /// The period is left unchanged when the code is out of range.
    pub async fn set_traffic_period(&self, period: i64) -> Result<()> {
        let monitor = self.monitor()?;
        let period = TrafficPeriod::try_from(period)?;
        monitor.set_period(period).await;
        Ok(())
    }

    /// The accounting period in effect.
    pub async fn traffic_period(&self) -> Result<TrafficPeriod> {
        Ok(self.monitor()?.period().await)
    }

    /// Sample all accounting chains immediately.
    pub async fn update_traffic(&self) -> Result<()> {
        self.monitor()?.sample().await
    }

    /// Instances of a network, including attaches and detaches in flight.
    pub fn instances_in_network(&self, network_id: &str) -> Result<Vec<String>> {
        Ok(self.state()?.cache.instances(network_id))
    }

    /// Subnet allocated to a network.
    pub fn network_subnet(&self, network_id: &str) -> Result<Option<Ipv4Net>> {
        Ok(self.state()?.subnets.lease(network_id).map(|lease| lease.subnet))
    }

    fn monitor(&self) -> Result<&TrafficMonitor> {
        self.traffic
            .as_deref()
            .ok_or(NetworkError::TrafficMonitoringDisabled)
    }

    fn state(&self) -> Result<RwLockReadGuard<'_, ManagerState>> {
        self.state
            .read()
            .map_err(|_| NetworkError::Internal("Lock poisoned".to_string()))
    }

    fn state_mut(&self) -> Result<RwLockWriteGuard<'_, ManagerState>> {
        self.state
            .write()
            .map_err(|_| NetworkError::Internal("Lock poisoned".to_string()))
    }
}

fn already_attached(instance_id: &str, network_id: &str) -> NetworkError {
    NetworkError::AlreadyAttached {
        instance_id: instance_id.to_string(),
        network_id: network_id.to_string(),
    }
}

/// Names of the entries of `dir`, directories only when `dirs` is set.
///
/// An unreadable directory yields nothing.
async fn list_dir(dir: &Path, dirs: bool) -> Vec<String> {
    let mut names = Vec::new();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return names,
    };

    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let is_dir = entry
                    .file_type()
                    .await
                    .map(|kind| kind.is_dir())
                    .unwrap_or(false);
                if is_dir == dirs {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Can't read directory");
                break;
            }
        }
    }

    names.sort();
    names
}

/// Instance IDs recorded in the address reservations of a network.
async fn read_instance_records(network_dir: &Path) -> Vec<String> {
    let mut instances = BTreeSet::new();

    for name in list_dir(network_dir, false).await {
        if HOUSEKEEPING_FILES.contains(&name.as_str()) {
            continue;
        }

        let path = network_dir.join(&name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => match parse_instance_record(&content) {
                Some(instance_id) => {
                    instances.insert(instance_id);
                }
                None => debug!(path = %path.display(), "Not an instance record, skipping"),
            },
            Err(e) => debug!(path = %path.display(), error = %e, "Can't read instance record, skipping"),
        }
    }

    instances.into_iter().collect()
}

/// The instance ID of a reservation file: its one line that is not the
/// interface name.
fn parse_instance_record(content: &str) -> Option<String> {
    let mut ids = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != INSTANCE_IF_NAME);

    match (ids.next(), ids.next()) {
        (Some(id), None) => Some(id.to_string()),
        _ => None,
    }
}
