use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::run;
use crate::config::DEFAULT_NETNS_DIR;
use crate::error::{NetworkError, Result};
use crate::netns::{netns_path, validate_name};
use crate::traits::NamespaceManager;

/// Named namespaces managed with `ip netns`.
///
/// `ip netns` always works in `/run/netns`; a different directory only
/// changes the reported paths.
pub struct IpNetns {
    dir: PathBuf,
}

impl IpNetns {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Default for IpNetns {
    fn default() -> Self {
        Self::new(DEFAULT_NETNS_DIR)
    }
}

fn namespace_error(instance_id: &str, reason: impl Into<String>) -> NetworkError {
    NetworkError::Namespace {
        instance_id: instance_id.to_string(),
        reason: reason.into(),
    }
}

#[async_trait]
impl NamespaceManager for IpNetns {
    fn path(&self, instance_id: &str) -> PathBuf {
        netns_path(&self.dir, instance_id)
    }

    #[instrument(skip(self))]
    async fn create(&self, instance_id: &str) -> Result<()> {
        validate_name(instance_id)?;

        if tokio::fs::try_exists(self.path(instance_id)).await.unwrap_or(false) {
            return Err(NetworkError::NamespaceExists(instance_id.to_string()));
        }

        let output = run("ip", &["netns", "add", instance_id])
            .await
            .map_err(|e| namespace_error(instance_id, e.to_string()))?;

        if !output.success {
            if output.stderr.contains("File exists") {
                return Err(NetworkError::NamespaceExists(instance_id.to_string()));
            }
            return Err(namespace_error(instance_id, output.stderr));
        }

        info!(instance_id = %instance_id, "Network namespace created");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn destroy(&self, instance_id: &str) -> Result<()> {
        validate_name(instance_id)?;

        let output = run("ip", &["netns", "delete", instance_id])
            .await
            .map_err(|e| namespace_error(instance_id, e.to_string()))?;

        if !output.success {
            if output.stderr.contains("No such file") {
                debug!(instance_id = %instance_id, "Network namespace already gone");
                return Ok(());
            }
            warn!(instance_id = %instance_id, stderr = %output.stderr, "Failed to delete network namespace");
            return Err(namespace_error(instance_id, output.stderr));
        }

        info!(instance_id = %instance_id, "Network namespace deleted");
        Ok(())
    }
}
