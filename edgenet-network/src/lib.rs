//! # edgenet Network
//!
//! Per-instance container networking for the edge service agent.
//!
//! For every service instance the crate creates an isolated network
//! namespace, attaches it to a per-workload bridge network, assigns an
//! address from a private pool, enforces firewall allow-lists, optionally
//! shapes bandwidth, publishes DNS aliases and accounts traffic against
//! per-period quotas.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   NetworkManager                     │
//! │   (attach / detach / queries, ordered rollback)      │
//! └───┬──────────┬─────────────┬─────────────┬───────────┘
//!     │          │             │             │
//!     ▼          ▼             ▼             ▼
//! ┌────────┐ ┌────────┐ ┌─────────────┐ ┌──────────────┐
//! │ Subnet │ │ Cache  │ │ Plugin chain│ │TrafficMonitor│
//! │  Pool  │ │        │ │   builder   │ │              │
//! └────────┘ └────────┘ └─────────────┘ └──────────────┘
//!                             │                 │
//!      ┌──────────────────────┼─────────────────┤
//!      ▼                      ▼                 ▼
//! ┌────────────────┐ ┌────────────────┐ ┌────────────────┐
//! │NamespaceManager│ │ PluginRuntime  │ │FirewallBackend │
//! └────────────────┘ └────────────────┘ └────────────────┘
//! ```
//!
//! Host-facing work goes through the capability traits in [`traits`]; the
//! [`linux`] module implements them with `ip` and `iptables`, [`mock`]
//! keeps everything in memory.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use edgenet_network::{mock::MockNetwork, NetworkManager, NetworkManagerConfig, NetworkParams};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mocks = MockNetwork::new("/run/netns");
//!     let manager = NetworkManager::new(NetworkManagerConfig::default(), mocks.backends(), None)
//!         .await
//!         .unwrap();
//!
//!     let params = NetworkParams::default()
//!         .with_hostname("web")
//!         .with_exposed_ports(["80/tcp"]);
//!     manager.add_instance_to_network("i1", "n1", params).await.unwrap();
//!
//!     let ip = manager.get_instance_ip("i1", "n1").unwrap();
//! }
//! ```

pub mod cache;
pub mod config;
pub mod dns;
pub mod error;
pub mod linux;
pub mod manager;
pub mod mock;
pub mod netns;
pub mod plugins;
pub mod subnet;
pub mod traffic;
pub mod traits;
pub mod types;
mod rollback;

pub use config::NetworkManagerConfig;
pub use error::{ErrorKind, NetworkError, Result};
pub use manager::NetworkManager;
pub use subnet::{SubnetLease, SubnetPool};
pub use traffic::{JsonTrafficStore, TrafficMonitor, TrafficPeriod, TrafficRecord};
pub use traits::{FirewallBackend, HostNetwork, NamespaceManager, NetworkBackends, PluginRuntime, TrafficStore};
pub use types::*;
