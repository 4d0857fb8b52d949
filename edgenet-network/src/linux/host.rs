use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use super::run;
use crate::error::{NetworkError, Result};
use crate::traits::HostNetwork;

/// Bridge inspection and removal with `ip`.
#[derive(Debug, Default)]
pub struct IpHostNetwork;

impl IpHostNetwork {
    pub fn new() -> Self {
        Self
    }
}

/// One entry of `ip -j addr show`.
#[derive(Debug, Deserialize)]
struct LinkAddresses {
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    family: String,
    local: String,
    prefixlen: u8,
}

/// First IPv4 subnet in `ip -j -4 addr show` output.
fn parse_bridge_subnet(json: &str) -> Result<Option<Ipv4Net>> {
    let links: Vec<LinkAddresses> = serde_json::from_str(json)?;

    let Some(info) = links
        .iter()
        .flat_map(|link| link.addr_info.iter())
        .find(|info| info.family == "inet")
    else {
        return Ok(None);
    };

    let address: Ipv4Addr = info
        .local
        .parse()
        .map_err(|_| NetworkError::HostNetwork(format!("Invalid bridge address {}", info.local)))?;
    let subnet = Ipv4Net::new(address, info.prefixlen)
        .map_err(|e| NetworkError::HostNetwork(e.to_string()))?;

    Ok(Some(subnet.trunc()))
}

fn missing_device(stderr: &str) -> bool {
    stderr.contains("does not exist") || stderr.contains("Cannot find device")
}

#[async_trait]
impl HostNetwork for IpHostNetwork {
    #[instrument(skip(self))]
    async fn bridge_subnet(&self, bridge: &str) -> Result<Option<Ipv4Net>> {
        let output = run("ip", &["-j", "-4", "addr", "show", "dev", bridge])
            .await
            .map_err(|e| NetworkError::HostNetwork(e.to_string()))?;

        if !output.success {
            if missing_device(&output.stderr) {
                return Ok(None);
            }
            return Err(NetworkError::HostNetwork(output.stderr));
        }

        let subnet = parse_bridge_subnet(&output.stdout)?;
        debug!(bridge = %bridge, subnet = ?subnet, "Probed bridge");

        Ok(subnet)
    }

    #[instrument(skip(self))]
    async fn remove_bridge(&self, bridge: &str) -> Result<()> {
        let output = run("ip", &["link", "delete", bridge])
            .await
            .map_err(|e| NetworkError::HostNetwork(e.to_string()))?;

        if !output.success {
            if missing_device(&output.stderr) {
                return Ok(());
            }
            return Err(NetworkError::HostNetwork(output.stderr));
        }

        info!(bridge = %bridge, "Bridge removed");
        Ok(())
    }
}
