//! Instance ↔ network membership cache.
//!
//! The cache is the source of truth for which instance is attached to which
//! network. An attachment moves through
//!
//! ```text
//! reserve ──► Pending ──► finalize ──► Ready ──► begin_detach ──► Detaching
//!                │                                                  │
//!                └──────────────────── remove ◄─────────────────────┘
//! ```
//!
//! A `Pending` entry is inserted before any slow work starts, so a second
//! attach of the same pair fails immediately.

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::debug;

use crate::error::{NetworkError, Result};

/// Lifecycle phase of an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentPhase {
    /// Attach in progress
    Pending,
    /// Attached, address known
    Ready,
    /// Detach in progress
    Detaching,
}

/// One instance attached to one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Lifecycle phase
    pub phase: AttachmentPhase,
    /// Assigned address, set by `finalize`
    pub address: Option<IpAddr>,
    /// Advertised hostnames
    pub hostnames: Vec<String>,
}

impl Attachment {
    fn pending() -> Self {
        Self {
            phase: AttachmentPhase::Pending,
            address: None,
            hostnames: Vec::new(),
        }
    }
}

/// Outcome of removing an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The pair was not cached
    Absent,
    /// Removed; `network_empty` is set when it was the last instance
    Removed { network_empty: bool },
}

/// Keyed store network → instance → attachment.
#[derive(Debug, Default)]
pub struct InstanceCache {
    networks: HashMap<String, HashMap<String, Attachment>>,
}

impl InstanceCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The attachment of a pair.
    pub fn get(&self, network_id: &str, instance_id: &str) -> Option<&Attachment> {
        self.networks.get(network_id)?.get(instance_id)
    }

    /// Whether the pair is cached in any phase.
    pub fn contains(&self, network_id: &str, instance_id: &str) -> bool {
        self.get(network_id, instance_id).is_some()
    }

    /// Insert a `Pending` placeholder for the pair.
    pub fn reserve(&mut self, network_id: &str, instance_id: &str) -> Result<()> {
        let instances = self.networks.entry(network_id.to_string()).or_default();

        if instances.contains_key(instance_id) {
            return Err(NetworkError::AlreadyAttached {
                instance_id: instance_id.to_string(),
                network_id: network_id.to_string(),
            });
        }

        instances.insert(instance_id.to_string(), Attachment::pending());
        debug!(network_id = %network_id, instance_id = %instance_id, "Reserved attachment");

        Ok(())
    }

    /// Claim `hostnames` for a pending attachment.
    ///
    /// Fails without claiming anything if another instance of the network
    /// already advertises one of the names. Names are compared exactly.
    pub fn claim_hostnames(&mut self, network_id: &str, instance_id: &str, hostnames: &[String]) -> Result<()> {
        let instances = self
            .networks
            .get_mut(network_id)
            .ok_or_else(|| not_attached(instance_id, network_id))?;

        let conflict = instances
            .iter()
            .filter(|(id, _)| id.as_str() != instance_id)
            .flat_map(|(_, attachment)| attachment.hostnames.iter())
            .find(|existing| hostnames.contains(existing));

        if let Some(hostname) = conflict {
            return Err(NetworkError::HostnameConflict {
                hostname: hostname.clone(),
                network_id: network_id.to_string(),
            });
        }

        let attachment = instances
            .get_mut(instance_id)
            .ok_or_else(|| not_attached(instance_id, network_id))?;
        attachment.hostnames = hostnames.to_vec();

        Ok(())
    }

    /// Complete a pending attachment with its address.
    pub fn finalize(&mut self, network_id: &str, instance_id: &str, address: IpAddr) -> Result<()> {
        let attachment = self
            .networks
            .get_mut(network_id)
            .and_then(|instances| instances.get_mut(instance_id))
            .ok_or_else(|| not_attached(instance_id, network_id))?;

        if attachment.phase != AttachmentPhase::Pending {
            return Err(NetworkError::Internal(format!(
                "Attachment of {} to {} is {:?}, expected Pending",
                instance_id, network_id, attachment.phase
            )));
        }

        attachment.phase = AttachmentPhase::Ready;
        attachment.address = Some(address);
        debug!(network_id = %network_id, instance_id = %instance_id, address = %address, "Attachment ready");

        Ok(())
    }

    /// Move a `Ready` attachment to `Detaching`.
    ///
    /// Returns the previous phase, or `None` if the pair is not cached.
    /// Only a `Ready` attachment changes phase.
    pub fn begin_detach(&mut self, network_id: &str, instance_id: &str) -> Option<AttachmentPhase> {
        let attachment = self.networks.get_mut(network_id)?.get_mut(instance_id)?;
        let previous = attachment.phase;

        if previous == AttachmentPhase::Ready {
            attachment.phase = AttachmentPhase::Detaching;
        }

        Some(previous)
    }

    /// Move a `Detaching` attachment back to `Ready` after a failed detach.
    pub fn abort_detach(&mut self, network_id: &str, instance_id: &str) {
        if let Some(attachment) = self
            .networks
            .get_mut(network_id)
            .and_then(|instances| instances.get_mut(instance_id))
        {
            if attachment.phase == AttachmentPhase::Detaching {
                attachment.phase = AttachmentPhase::Ready;
            }
        }
    }

    /// Remove the pair, dropping the network when it becomes empty.
    pub fn remove(&mut self, network_id: &str, instance_id: &str) -> Removal {
        let Some(instances) = self.networks.get_mut(network_id) else {
            return Removal::Absent;
        };

        if instances.remove(instance_id).is_none() {
            return Removal::Absent;
        }

        let network_empty = instances.is_empty();
        if network_empty {
            self.networks.remove(network_id);
        }

        debug!(network_id = %network_id, instance_id = %instance_id, network_empty, "Removed attachment");

        Removal::Removed { network_empty }
    }

    /// Instances cached for a network, in any phase.
    pub fn instances(&self, network_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .networks
            .get(network_id)
            .map(|instances| instances.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Whether any instance of the network is cached.
    pub fn has_network(&self, network_id: &str) -> bool {
        self.networks.contains_key(network_id)
    }
}

fn not_attached(instance_id: &str, network_id: &str) -> NetworkError {
    NetworkError::NotAttached {
        instance_id: instance_id.to_string(),
        network_id: network_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_is_exclusive() {
        let mut cache = InstanceCache::new();

        cache.reserve("n1", "i1").unwrap();
        let err = cache.reserve("n1", "i1").unwrap_err();
        assert!(matches!(err, NetworkError::AlreadyAttached { .. }));

        // Same instance in another network is fine.
        cache.reserve("n2", "i1").unwrap();
    }

    #[test]
    fn test_lifecycle() {
        let mut cache = InstanceCache::new();
        let address: IpAddr = "172.17.0.2".parse().unwrap();

        cache.reserve("n1", "i1").unwrap();
        assert_eq!(cache.get("n1", "i1").unwrap().phase, AttachmentPhase::Pending);

        cache.finalize("n1", "i1", address).unwrap();
        let attachment = cache.get("n1", "i1").unwrap();
        assert_eq!(attachment.phase, AttachmentPhase::Ready);
        assert_eq!(attachment.address, Some(address));

        assert_eq!(cache.begin_detach("n1", "i1"), Some(AttachmentPhase::Ready));
        assert_eq!(cache.begin_detach("n1", "i1"), Some(AttachmentPhase::Detaching));

        cache.abort_detach("n1", "i1");
        assert_eq!(cache.get("n1", "i1").unwrap().phase, AttachmentPhase::Ready);

        assert_eq!(cache.remove("n1", "i1"), Removal::Removed { network_empty: true });
        assert_eq!(cache.remove("n1", "i1"), Removal::Absent);
        assert!(!cache.has_network("n1"));
    }

    #[test]
    fn test_finalize_requires_pending() {
        let mut cache = InstanceCache::new();
        let address: IpAddr = "172.17.0.2".parse().unwrap();

        assert!(cache.finalize("n1", "i1", address).is_err());

        cache.reserve("n1", "i1").unwrap();
        cache.finalize("n1", "i1", address).unwrap();
        assert!(cache.finalize("n1", "i1", address).is_err());
    }

    #[test]
    fn test_hostname_conflict() {
        let mut cache = InstanceCache::new();
        let web = vec!["web".to_string()];

        cache.reserve("n1", "i1").unwrap();
        cache.claim_hostnames("n1", "i1", &web).unwrap();

        cache.reserve("n1", "i2").unwrap();
        let err = cache.claim_hostnames("n1", "i2", &web).unwrap_err();
        assert!(matches!(err, NetworkError::HostnameConflict { ref hostname, .. } if hostname == "web"));
        assert!(cache.get("n1", "i2").unwrap().hostnames.is_empty());

        // Other networks and case variants do not collide.
        cache.reserve("n2", "i3").unwrap();
        cache.claim_hostnames("n2", "i3", &web).unwrap();
        cache.claim_hostnames("n1", "i2", &["Web".to_string()]).unwrap();
    }

    #[test]
    fn test_remove_keeps_non_empty_network() {
        let mut cache = InstanceCache::new();
        cache.reserve("n1", "i1").unwrap();
        cache.reserve("n1", "i2").unwrap();

        assert_eq!(cache.remove("n1", "i1"), Removal::Removed { network_empty: false });
        assert_eq!(cache.instances("n1"), vec!["i2".to_string()]);
    }
}
