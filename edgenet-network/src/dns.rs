//! hosts and resolv.conf files written into instance root filesystems.

use std::fmt::Write as _;
use std::path::Path;

use tracing::debug;

use crate::error::Result;
use crate::types::HostEntry;

const LOCALHOST_ENTRIES: &[(&str, &str)] = &[
    ("127.0.0.1", "localhost"),
    ("::1", "localhost ip6-localhost ip6-loopback"),
];

/// Render a hosts file for an instance.
///
/// The instance address is published under the network ID and, if set,
/// the instance hostname. `hosts` are appended in order.
pub fn render_hosts(address: &str, network_id: &str, hostname: &str, hosts: &[HostEntry]) -> String {
    let mut content = String::new();

    for (ip, names) in LOCALHOST_ENTRIES {
        let _ = writeln!(content, "{}\t{}", ip, names);
    }

    if hostname.is_empty() {
        let _ = writeln!(content, "{}\t{}", address, network_id);
    } else {
        let _ = writeln!(content, "{}\t{} {}", address, network_id, hostname);
    }

    for host in hosts {
        let _ = writeln!(content, "{}\t{}", host.ip, host.hostname);
    }

    content
}

/// Render resolv.conf: `main` servers first, then `extra`.
pub fn render_resolv_conf(main: &[String], extra: &[String]) -> String {
    let mut content = String::new();

    for server in main.iter().chain(extra) {
        let _ = writeln!(content, "nameserver\t{}", server);
    }

    content
}

/// Write the hosts file of an instance, creating parent directories.
pub async fn write_hosts_file(
    path: &Path,
    address: &str,
    network_id: &str,
    hostname: &str,
    hosts: &[HostEntry],
) -> Result<()> {
    write_file(path, render_hosts(address, network_id, hostname, hosts)).await
}

/// Write resolv.conf.
///
/// `fallback` is used when the runtime reported no nameservers.
pub async fn write_resolv_conf(
    path: &Path,
    nameservers: &[String],
    fallback: &[String],
    extra: &[String],
) -> Result<()> {
    let main = if nameservers.is_empty() { fallback } else { nameservers };
    write_file(path, render_resolv_conf(main, extra)).await
}

async fn write_file(path: &Path, content: String) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    tokio::fs::write(path, content).await?;
    debug!(path = %path.display(), "Wrote DNS artifact");

    Ok(())
}
