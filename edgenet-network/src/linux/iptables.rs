use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::run;
use crate::error::{NetworkError, Result};
use crate::traits::FirewallBackend;
use crate::types::TrafficDirection;

/// Built-in chains accounting chains are hooked into.
const PARENT_CHAINS: [&str; 3] = ["INPUT", "OUTPUT", "FORWARD"];

/// Accounting chains in the iptables filter table.
///
/// Each chain holds a single `RETURN` rule whose byte counter is the
/// traffic figure; capping inserts a `DROP` rule in front of it.
#[derive(Debug, Default)]
pub struct IptablesFirewall;

impl IptablesFirewall {
    pub fn new() -> Self {
        Self
    }

    async fn iptables(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["-w", "-t", "filter"];
        full.extend_from_slice(args);

        let output = run("iptables", &full)
            .await
            .map_err(|e| NetworkError::Firewall(e.to_string()))?;

        if !output.success {
            return Err(NetworkError::Firewall(format!(
                "iptables {}: {}",
                args.join(" "),
                output.stderr
            )));
        }

        Ok(output.stdout)
    }

    /// Delete every rule of the built-in chains jumping to `chain`.
    async fn unhook(&self, chain: &str) -> Result<()> {
        for parent in PARENT_CHAINS {
            let rules = self.iptables(&["-S", parent]).await?;

            for rule in jump_rules(&rules, chain) {
                let mut args: Vec<&str> = vec!["-D"];
                args.extend(rule.iter().map(String::as_str));

                if let Err(e) = self.iptables(&args).await {
                    warn!(chain = %chain, parent, error = %e, "Failed to remove jump rule");
                }
            }
        }

        Ok(())
    }
}

/// Rules of `iptables -S` output jumping to `chain`, without the `-A`.
fn jump_rules(rules: &str, chain: &str) -> Vec<Vec<String>> {
    rules
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let jumps = tokens.windows(2).any(|pair| pair[0] == "-j" && pair[1] == chain);

            if tokens.first() == Some(&"-A") && jumps {
                Some(tokens[1..].iter().map(|t| t.to_string()).collect())
            } else {
                None
            }
        })
        .collect()
}

/// Bytes matched by the `RETURN` rules of `iptables -L -v -x -n` output.
fn parse_counter(listing: &str) -> u64 {
    listing
        .lines()
        .skip(2)
        .filter_map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            match columns.as_slice() {
                [_, bytes, "RETURN", ..] => bytes.parse::<u64>().ok(),
                _ => None,
            }
        })
        .sum()
}

fn missing_chain(e: &NetworkError) -> bool {
    matches!(e, NetworkError::Firewall(msg)
        if msg.contains("No chain/target/match") || msg.contains("does not exist"))
}

#[async_trait]
impl FirewallBackend for IptablesFirewall {
    #[instrument(skip(self))]
    async fn create_chain(&self, chain: &str) -> Result<()> {
        match self.iptables(&["-N", chain]).await {
            Ok(_) => {
                debug!(chain = %chain, "Chain created");
                Ok(())
            }
            Err(NetworkError::Firewall(msg)) if msg.contains("already exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn delete_chain(&self, chain: &str) -> Result<()> {
        self.unhook(chain).await?;

        for args in [["-F", chain], ["-X", chain]] {
            match self.iptables(&args).await {
                Ok(_) => {}
                Err(e) if missing_chain(&e) => return Ok(()),
                Err(e) => return Err(e),
            }
        }

        debug!(chain = %chain, "Chain deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn attach_accounting(
        &self,
        chain: &str,
        direction: TrafficDirection,
        address: Option<&str>,
    ) -> Result<()> {
        let mut jump: Vec<&str> = match (direction, address) {
            (TrafficDirection::Input, None) => vec!["-I", "INPUT"],
            (TrafficDirection::Output, None) => vec!["-I", "OUTPUT"],
            (TrafficDirection::Input, Some(address)) => vec!["-I", "FORWARD", "-d", address],
            (TrafficDirection::Output, Some(address)) => vec!["-I", "FORWARD", "-s", address],
        };
        jump.extend_from_slice(&["-j", chain]);

        self.iptables(&["-A", chain, "-j", "RETURN"]).await?;
        self.iptables(&jump).await?;

        info!(chain = %chain, direction = %direction, address = ?address, "Accounting attached");
        Ok(())
    }

    async fn read_counter(&self, chain: &str) -> Result<Option<u64>> {
        match self.iptables(&["-L", chain, "-v", "-x", "-n"]).await {
            Ok(listing) => Ok(Some(parse_counter(&listing))),
            Err(e) if missing_chain(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn set_drop(&self, chain: &str, enabled: bool) -> Result<()> {
        let present = self.iptables(&["-C", chain, "-j", "DROP"]).await.is_ok();

        match (enabled, present) {
            (true, false) => {
                self.iptables(&["-I", chain, "1", "-j", "DROP"]).await?;
            }
            (false, true) => {
                self.iptables(&["-D", chain, "-j", "DROP"]).await?;
            }
            _ => {}
        }

        Ok(())
    }
}
