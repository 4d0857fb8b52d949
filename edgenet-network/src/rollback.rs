//! Ordered compensation of a partially completed attach.
//!
//! Each completed step pushes the action that undoes it. On failure the
//! actions run in reverse order; their errors are logged and collected,
//! never propagated, so one failing compensation doesn't stop the others.

use std::future::Future;

use tracing::{debug, error};

use crate::error::{NetworkError, Result};
use crate::plugins::{NetworkConfigList, RuntimeConf};

/// Undo action of one attach step.
#[derive(Debug)]
pub(crate) enum Undo {
    /// Drop the cache placeholder and tear the network down if it was the
    /// last instance.
    Reservation,
    /// Destroy the instance namespace.
    Namespace,
    /// Delete the attachment through the plugin runtime.
    PluginChain {
        list: NetworkConfigList,
        rt: Box<RuntimeConf>,
    },
    /// Stop instance traffic accounting.
    TrafficMonitor,
}

impl Undo {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Undo::Reservation => "reservation",
            Undo::Namespace => "namespace",
            Undo::PluginChain { .. } => "plugin chain",
            Undo::TrafficMonitor => "traffic monitor",
        }
    }
}

/// Stack of undo actions for one (instance, network) pair.
#[derive(Debug)]
pub(crate) struct Rollback {
    instance_id: String,
    network_id: String,
    steps: Vec<Undo>,
}

impl Rollback {
    pub(crate) fn new(instance_id: &str, network_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            network_id: network_id.to_string(),
            steps: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, undo: Undo) {
        self.steps.push(undo);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.steps.len()
    }

    /// Forget every action; the attach went through.
    pub(crate) fn commit(mut self) {
        self.steps.clear();
    }

    /// Run the actions last-in first-out and return the errors they raised.
    pub(crate) async fn unwind<F, Fut>(mut self, mut compensate: F) -> Vec<NetworkError>
    where
        F: FnMut(Undo) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut errors = Vec::new();

        while let Some(step) = self.steps.pop() {
            let name = step.name();

            match compensate(step).await {
                Ok(()) => debug!(
                    instance_id = %self.instance_id,
                    network_id = %self.network_id,
                    step = name,
                    "Rolled back"
                ),
                Err(e) => {
                    error!(
                        instance_id = %self.instance_id,
                        network_id = %self.network_id,
                        step = name,
                        error = %e,
                        "Rollback step failed"
                    );
                    errors.push(e);
                }
            }
        }

        errors
    }
}
