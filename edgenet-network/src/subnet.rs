//! Subnet pool for workload networks.
//!
//! Every workload network gets one private subnet carved out of the
//! configured ranges. Live subnets never overlap; a subnet returns to the
//! pool only when its network becomes empty.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tracing::{debug, info, warn};

use crate::error::{NetworkError, Result};

/// A subnet allocated to one workload network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetLease {
    /// Allocated subnet
    pub subnet: Ipv4Net,
    /// Bridge/gateway address (first host address)
    pub gateway: Ipv4Addr,
    /// First address handed out to instances
    pub range_start: Ipv4Addr,
    /// Last address handed out to instances
    pub range_end: Ipv4Addr,
}

impl SubnetLease {
    /// Build a lease for `subnet`, reserving network, gateway and broadcast.
    pub fn new(subnet: Ipv4Net) -> Result<Self> {
        let subnet = subnet.trunc();
        let (range_start, range_end) = address_range(&subnet)?;
        let gateway = subnet.hosts().next().ok_or_else(|| {
            NetworkError::InvalidConfig(format!("Subnet {} is too small", subnet))
        })?;

        Ok(Self {
            subnet,
            gateway,
            range_start,
            range_end,
        })
    }
}

/// Usable instance address range of a subnet.
///
/// The network address, the gateway (first host) and the broadcast address
/// are excluded.
pub fn address_range(subnet: &Ipv4Net) -> Result<(Ipv4Addr, Ipv4Addr)> {
    if subnet.prefix_len() > 30 {
        return Err(NetworkError::InvalidConfig(format!(
            "Subnet {} has no room for instance addresses",
            subnet
        )));
    }

    let network = u32::from(subnet.network());
    let broadcast = u32::from(subnet.broadcast());

    Ok((Ipv4Addr::from(network + 2), Ipv4Addr::from(broadcast - 1)))
}

/// Allocates non-overlapping subnets keyed by network ID.
#[derive(Debug, Clone)]
pub struct SubnetPool {
    /// Ranges fresh subnets are carved from
    ranges: Vec<Ipv4Net>,
    /// Prefix length of fresh subnets
    prefix_len: u8,
    /// Live allocations
    leases: HashMap<String, SubnetLease>,
}

impl SubnetPool {
    /// Create a pool carving `/prefix_len` subnets out of `ranges`.
    pub fn new(ranges: Vec<Ipv4Net>, prefix_len: u8) -> Self {
        Self {
            ranges,
            prefix_len,
            leases: HashMap::new(),
        }
    }

    /// Current allocation of a network, if any.
    pub fn lease(&self, network_id: &str) -> Option<SubnetLease> {
        self.leases.get(network_id).copied()
    }

    /// Allocate a subnet for `network_id`.
    ///
    /// Returns the existing allocation if there is one. Otherwise `adopt`
    /// (the subnet of a bridge left over from a previous run) is taken over
    /// when it does not overlap a live subnet, and a fresh subnet is drawn
    /// from the configured ranges as a last resort.
    pub fn allocate(&mut self, network_id: &str, adopt: Option<Ipv4Net>) -> Result<SubnetLease> {
        if let Some(lease) = self.leases.get(network_id) {
            return Ok(*lease);
        }

        if let Some(subnet) = adopt {
            if self.overlaps(&subnet) {
                warn!(
                    network_id = %network_id,
                    subnet = %subnet,
                    "Existing bridge subnet overlaps a live network, allocating a new one"
                );
            } else {
                match SubnetLease::new(subnet) {
                    Ok(lease) => {
                        info!(network_id = %network_id, subnet = %lease.subnet, "Adopted existing bridge subnet");
                        self.leases.insert(network_id.to_string(), lease);
                        return Ok(lease);
                    }
                    Err(e) => {
                        warn!(network_id = %network_id, error = %e, "Can't adopt existing bridge subnet");
                    }
                }
            }
        }

        let subnet = self
            .next_free()
            .ok_or_else(|| NetworkError::SubnetExhausted(network_id.to_string()))?;
        let lease = SubnetLease::new(subnet)?;

        info!(network_id = %network_id, subnet = %lease.subnet, "Allocated subnet");
        self.leases.insert(network_id.to_string(), lease);

        Ok(lease)
    }

    /// Return the subnet of `network_id` to the pool.
    pub fn release(&mut self, network_id: &str) -> Option<SubnetLease> {
        let lease = self.leases.remove(network_id);
        if let Some(lease) = &lease {
            debug!(network_id = %network_id, subnet = %lease.subnet, "Released subnet");
        }
        lease
    }

    /// Whether `subnet` overlaps any live allocation.
    pub fn overlaps(&self, subnet: &Ipv4Net) -> bool {
        self.leases
            .values()
            .any(|lease| lease.subnet.contains(subnet) || subnet.contains(&lease.subnet))
    }

    /// Number of live allocations.
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    /// Whether there are no live allocations.
    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    fn next_free(&self) -> Option<Ipv4Net> {
        self.ranges
            .iter()
            .filter_map(|range| range.subnets(self.prefix_len).ok())
            .flatten()
            .find(|candidate| !self.overlaps(candidate))
    }
}
