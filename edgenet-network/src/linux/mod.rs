//! Host implementations of the namespace, host network and firewall
//! capabilities, driven through `ip(8)` and `iptables(8)`.
//!
//! All of them need `CAP_NET_ADMIN`.

mod host;
mod iptables;
mod netns;

pub use host::IpHostNetwork;
pub use iptables::IptablesFirewall;
pub use netns::IpNetns;

use tokio::process::Command;
use tracing::trace;

/// Captured result of a finished command.
#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run `program` with `args` and capture its output.
///
/// Only spawn failures are errors; a non-zero exit is reported through
/// [`CommandOutput::success`].
pub(crate) async fn run(program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
    let output = Command::new(program).args(args).output().await?;

    let result = CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    trace!(program, args = ?args, success = result.success, "Command finished");

    Ok(result)
}
