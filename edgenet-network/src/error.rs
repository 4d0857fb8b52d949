//! Error types for the network manager.

use thiserror::Error;

/// Broad classes of failure, used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input or plugin output; nothing was (or remains) mutated.
    Config,
    /// The request collides with existing state.
    Conflict,
    /// A host or plugin operation failed.
    Resource,
    /// The target is not attached, not tracked, or monitoring is off.
    NotFound,
    /// Bookkeeping failure inside the manager.
    Internal,
}

/// Errors that can occur during network operations.
#[derive(Error, Debug)]
pub enum NetworkError {
    // =========================================================================
    // Configuration errors
    // =========================================================================
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Exposed port entry is not `port[/protocol]`.
    #[error("Unsupported exposed port format: {0}")]
    InvalidExposedPort(String),

    /// Allowed connection entry is not `instance/port[/protocol]`.
    #[error("Unsupported allowed connection format: {0}")]
    InvalidAllowedConnection(String),

    /// Traffic period outside of the supported range.
    #[error("Invalid traffic period: {0}")]
    InvalidTrafficPeriod(String),

    /// The plugin runtime did not report an address.
    #[error("No IP address returned for instance {0}")]
    NoAddress(String),

    // =========================================================================
    // Conflict errors
    // =========================================================================
    /// Instance already has an attachment in this network.
    #[error("Instance {instance_id} already in network {network_id}")]
    AlreadyAttached {
        instance_id: String,
        network_id: String,
    },

    /// The attachment is still being set up.
    #[error("Instance {instance_id} is still being attached to network {network_id}")]
    AttachInProgress {
        instance_id: String,
        network_id: String,
    },

    /// Hostname is advertised by another instance of the network.
    #[error("Hostname {hostname} already exists in network {network_id}")]
    HostnameConflict {
        hostname: String,
        network_id: String,
    },

    /// Namespace with that name already exists.
    #[error("Network namespace {0} already exists")]
    NamespaceExists(String),

    // =========================================================================
    // Resource errors
    // =========================================================================
    /// No free subnet left in the configured ranges.
    #[error("No free subnet available for network {0}")]
    SubnetExhausted(String),

    /// Namespace operation failed.
    #[error("Network namespace operation failed for {instance_id}: {reason}")]
    Namespace {
        instance_id: String,
        reason: String,
    },

    /// Plugin runtime operation failed.
    #[error("Plugin {operation} failed: {reason}")]
    Plugin {
        operation: &'static str,
        reason: String,
    },

    /// Host network operation failed.
    #[error("Host network operation failed: {0}")]
    HostNetwork(String),

    /// Firewall/accounting operation failed.
    #[error("Firewall operation failed: {0}")]
    Firewall(String),

    /// Persistent traffic store failed.
    #[error("Traffic store error: {0}")]
    Store(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Not-found conditions
    // =========================================================================
    /// Instance is not attached to the network.
    #[error("Instance {instance_id} is not in network {network_id}")]
    NotAttached {
        instance_id: String,
        network_id: String,
    },

    /// Traffic monitoring was not configured.
    #[error("Traffic monitoring is disabled")]
    TrafficMonitoringDisabled,

    /// No accounting chains are tracked for the instance.
    #[error("Traffic chain for instance {0} is not found")]
    TrafficChainNotFound(String),

    // =========================================================================
    // Internal errors
    // =========================================================================
    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// A failure inside a multi-step operation, with its context.
    #[error("{stage} failed for instance {instance_id} in network {network_id}: {source}")]
    Stage {
        instance_id: String,
        network_id: String,
        stage: &'static str,
        #[source]
        source: Box<NetworkError>,
    },
}

impl NetworkError {
    /// Wrap `self` with the instance/network/stage it happened in.
    pub fn at_stage(self, instance_id: &str, network_id: &str, stage: &'static str) -> Self {
        NetworkError::Stage {
            instance_id: instance_id.to_string(),
            network_id: network_id.to_string(),
            stage,
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping stage context.
    pub fn root_cause(&self) -> &NetworkError {
        match self {
            NetworkError::Stage { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self.root_cause() {
            NetworkError::InvalidConfig(_)
            | NetworkError::InvalidExposedPort(_)
            | NetworkError::InvalidAllowedConnection(_)
            | NetworkError::InvalidTrafficPeriod(_)
            | NetworkError::NoAddress(_) => ErrorKind::Config,

            NetworkError::AlreadyAttached { .. }
            | NetworkError::AttachInProgress { .. }
            | NetworkError::HostnameConflict { .. }
            | NetworkError::NamespaceExists(_) => ErrorKind::Conflict,

            NetworkError::SubnetExhausted(_)
            | NetworkError::Namespace { .. }
            | NetworkError::Plugin { .. }
            | NetworkError::HostNetwork(_)
            | NetworkError::Firewall(_)
            | NetworkError::Store(_)
            | NetworkError::Io(_) => ErrorKind::Resource,

            NetworkError::NotAttached { .. }
            | NetworkError::TrafficMonitoringDisabled
            | NetworkError::TrafficChainNotFound(_) => ErrorKind::NotFound,

            NetworkError::Serialization(_)
            | NetworkError::Internal(_)
            | NetworkError::Stage { .. } => ErrorKind::Internal,
        }
    }
}

impl From<serde_json::Error> for NetworkError {
    fn from(e: serde_json::Error) -> Self {
        NetworkError::Serialization(e.to_string())
    }
}

/// Result type alias for network operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_keeps_root_cause() {
        let err = NetworkError::HostnameConflict {
            hostname: "web".to_string(),
            network_id: "n1".to_string(),
        }
        .at_stage("i2", "n1", "hostname claim");

        assert!(matches!(err.root_cause(), NetworkError::HostnameConflict { .. }));
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let message = err.to_string();
        assert!(message.contains("i2"));
        assert!(message.contains("hostname claim"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(NetworkError::TrafficMonitoringDisabled.kind(), ErrorKind::NotFound);
        assert_eq!(NetworkError::SubnetExhausted("n1".into()).kind(), ErrorKind::Resource);
        assert_eq!(NetworkError::InvalidExposedPort("a/b/c".into()).kind(), ErrorKind::Config);
    }
}
