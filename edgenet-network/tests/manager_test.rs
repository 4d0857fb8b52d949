//! Integration tests for the network manager.
//!
//! The manager is driven end to end through the in-memory capabilities of
//! the `mock` module.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use edgenet_common::{init_logging, LogFormat};
use edgenet_network::mock::{MemoryTrafficStore, MockNetwork, RuntimeOp};
use edgenet_network::plugins::{self, InputAccess};
use edgenet_network::subnet::SubnetLease;
use edgenet_network::traffic::{instance_chains, SYSTEM_IN_CHAIN, SYSTEM_OUT_CHAIN};
use edgenet_network::{
    ErrorKind, HostEntry, NamespaceManager, NetworkError, NetworkManager, NetworkManagerConfig, NetworkParams,
    PluginRuntime, TrafficPeriod, TrafficStore,
};
use ipnet::Ipv4Net;
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    mocks: MockNetwork,
    store: Arc<MemoryTrafficStore>,
    manager: NetworkManager,
}

impl Harness {
    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

fn config_in(dir: &TempDir) -> NetworkManagerConfig {
    let mut config = NetworkManagerConfig::default();
    config.working_dir = dir.path().join("work");
    config.netns_dir = dir.path().join("netns");
    config
}

async fn harness(with_traffic: bool) -> Harness {
    // Only the first test to get here installs the subscriber.
    let _ = init_logging("debug", LogFormat::Test);

    let dir = tempfile::tempdir().unwrap();
    let mocks = MockNetwork::new(dir.path().join("netns"));
    let store = Arc::new(MemoryTrafficStore::new());

    let traffic_store: Option<Arc<dyn TrafficStore>> = if with_traffic {
        Some(store.clone())
    } else {
        None
    };

    let manager = NetworkManager::new(config_in(&dir), mocks.backends(), traffic_store)
        .await
        .expect("Failed to create manager");

    Harness {
        dir,
        mocks,
        store,
        manager,
    }
}

fn web_params() -> NetworkParams {
    NetworkParams::default()
        .with_hostname("web")
        .with_exposed_ports(["80/tcp"])
}

/// Nothing of the pair is left anywhere.
fn assert_clean(h: &Harness, instance_id: &str, network_id: &str) {
    assert!(h.manager.instances_in_network(network_id).unwrap().is_empty());
    assert!(h.manager.network_subnet(network_id).unwrap().is_none());
    assert!(!h.mocks.namespaces.exists(instance_id));
    assert!(!h.mocks.runtime.is_attached(network_id, instance_id));
    assert!(matches!(
        h.manager.get_instance_ip(instance_id, network_id),
        Err(NetworkError::NotAttached { .. })
    ));
}

// =============================================================================
// Attach
// =============================================================================

#[tokio::test]
async fn test_attach_web_instance() {
    let h = harness(false).await;

    h.manager
        .add_instance_to_network("i1", "n1", web_params())
        .await
        .unwrap();

    let chain = h.mocks.runtime.config_of("n1", "i1").expect("No chain recorded");
    assert_eq!(chain.bridge().unwrap().bridge, "br-n1");

    let firewall = chain.firewall().unwrap();
    assert_eq!(firewall.iptables_admin_chain_name, "INSTANCE_i1");
    assert_eq!(
        firewall.input_access,
        vec![InputAccess {
            port: "80".to_string(),
            protocol: "tcp".to_string(),
        }]
    );
    assert!(chain.bandwidth().is_none());
    assert_eq!(chain.dns().unwrap().domain_name, "n1");

    assert_eq!(
        h.manager.get_instance_ip("i1", "n1").unwrap(),
        "172.17.0.2".parse::<std::net::IpAddr>().unwrap()
    );
    assert_eq!(h.manager.instances_in_network("n1").unwrap(), vec!["i1".to_string()]);
    assert_eq!(
        h.manager.network_subnet("n1").unwrap(),
        Some("172.17.0.0/24".parse().unwrap())
    );
    assert!(h.mocks.namespaces.exists("i1"));
    assert_eq!(h.manager.netns_path("i1"), h.path("netns").join("i1"));

    let rt = h.mocks.runtime.runtime_of("n1", "i1").unwrap();
    assert_eq!(rt.netns, h.path("netns").join("i1"));
    assert_eq!(rt.capability_args["aliases"]["n1"][0], "web");
}

#[tokio::test]
async fn test_attach_same_pair_twice() {
    let h = harness(false).await;

    h.manager
        .add_instance_to_network("i1", "n1", NetworkParams::default())
        .await
        .unwrap();

    let err = h
        .manager
        .add_instance_to_network("i1", "n1", NetworkParams::default())
        .await
        .unwrap_err();

    assert!(matches!(err, NetworkError::AlreadyAttached { .. }));
    assert_eq!(h.mocks.runtime.add_calls(), 1);
}

#[tokio::test]
async fn test_hostname_conflict_leaves_first_attach() {
    let h = harness(false).await;

    h.manager
        .add_instance_to_network("i1", "n1", web_params())
        .await
        .unwrap();

    let err = h
        .manager
        .add_instance_to_network("i2", "n1", NetworkParams::default().with_hostname("web"))
        .await
        .unwrap_err();

    assert!(matches!(err.root_cause(), NetworkError::HostnameConflict { hostname, .. } if hostname == "web"));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    assert_eq!(h.manager.instances_in_network("n1").unwrap(), vec!["i1".to_string()]);
    assert!(h.manager.get_instance_ip("i1", "n1").is_ok());
    assert!(h.mocks.namespaces.exists("i1"));
    assert!(!h.mocks.namespaces.exists("i2"));
    assert_eq!(h.mocks.runtime.add_calls(), 1);

    // The same hostname in another network is fine.
    h.manager
        .add_instance_to_network("i2", "n2", NetworkParams::default().with_hostname("web"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_generated_hostnames_conflict() {
    let h = harness(false).await;
    let params = NetworkParams::default().with_ident("svc", "subj", 0);

    h.manager
        .add_instance_to_network("i1", "n1", params.clone())
        .await
        .unwrap();

    let rt = h.mocks.runtime.runtime_of("n1", "i1").unwrap();
    let aliases = rt.capability_args["aliases"]["n1"].as_array().unwrap().clone();
    assert!(aliases.contains(&serde_json::json!("0.subj.svc")));
    assert!(aliases.contains(&serde_json::json!("subj.svc.n1")));

    let err = h
        .manager
        .add_instance_to_network("i2", "n1", params)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_malformed_ports_rejected_before_mutation() {
    let h = harness(false).await;

    let err = h
        .manager
        .add_instance_to_network("i1", "n1", NetworkParams::default().with_exposed_ports(["80/tcp/x"]))
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::InvalidExposedPort(_)));

    let err = h
        .manager
        .add_instance_to_network("i1", "n1", NetworkParams::default().with_allowed_connections(["i2"]))
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::InvalidAllowedConnection(_)));
    assert_eq!(err.kind(), ErrorKind::Config);

    assert_clean(&h, "i1", "n1");
    assert_eq!(h.mocks.namespaces.count(), 0);
}

#[tokio::test]
async fn test_bandwidth_plugin_added_for_rates() {
    let h = harness(false).await;

    h.manager
        .add_instance_to_network("i1", "n1", NetworkParams::default().with_bandwidth(100, 0))
        .await
        .unwrap();

    let chain = h.mocks.runtime.config_of("n1", "i1").unwrap();
    let bandwidth = chain.bandwidth().unwrap();
    assert_eq!(bandwidth.ingress_rate, 100_000);
    assert_eq!(bandwidth.ingress_burst, plugins::BURST_LEN);
    assert_eq!(bandwidth.egress_rate, 0);

    let types: Vec<&str> = chain.plugins.iter().map(|p| p.plugin_type()).collect();
    assert_eq!(types, vec!["bridge", "aos-firewall", "bandwidth", "dnsname"]);
}

#[tokio::test]
async fn test_dns_files_written() {
    let h = harness(false).await;
    let hosts_path = h.path("rootfs/etc/hosts");
    let resolv_path = h.path("rootfs/etc/resolv.conf");

    let mut params = web_params();
    params.hosts = vec![HostEntry::new("10.0.0.100", "registry")];
    params.dns_servers = vec!["10.0.0.53".to_string()];
    params.hosts_file_path = Some(hosts_path.clone());
    params.resolv_conf_file_path = Some(resolv_path.clone());

    h.manager.add_instance_to_network("i1", "n1", params).await.unwrap();

    let hosts = std::fs::read_to_string(&hosts_path).unwrap();
    assert!(hosts.contains("127.0.0.1\tlocalhost"));
    assert!(hosts.contains("172.17.0.2\tn1 web"));
    assert!(hosts.contains("10.0.0.100\tregistry"));

    let resolv = std::fs::read_to_string(&resolv_path).unwrap();
    assert_eq!(resolv, "nameserver\t8.8.8.8\nnameserver\t10.0.0.53\n");
}

#[tokio::test]
async fn test_runtime_nameservers_replace_fallback() {
    let h = harness(false).await;
    let resolv_path = h.path("resolv.conf");
    h.mocks.runtime.set_nameservers(vec!["172.17.0.1".to_string()]);

    let mut params = NetworkParams::default();
    params.resolv_conf_file_path = Some(resolv_path.clone());
    h.manager.add_instance_to_network("i1", "n1", params).await.unwrap();

    assert_eq!(std::fs::read_to_string(&resolv_path).unwrap(), "nameserver\t172.17.0.1\n");
}

// =============================================================================
// Rollback
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Failure {
    Namespace,
    Validate,
    Add,
    NoAddress,
    DnsFiles,
    TrafficMonitor,
}

#[tokio::test]
async fn test_rollback_after_each_stage() {
    let failures = [
        Failure::Namespace,
        Failure::Validate,
        Failure::Add,
        Failure::NoAddress,
        Failure::DnsFiles,
        Failure::TrafficMonitor,
    ];

    for failure in failures {
        let h = harness(true).await;
        let mut params = web_params();

        match failure {
            Failure::Namespace => h.mocks.namespaces.fail_create(true),
            Failure::Validate => h.mocks.runtime.fail_on(RuntimeOp::Validate),
            Failure::Add => h.mocks.runtime.fail_on(RuntimeOp::Add),
            Failure::NoAddress => h.mocks.runtime.omit_address(true),
            Failure::DnsFiles => {
                let blocker = h.path("blocker");
                std::fs::write(&blocker, "not a directory").unwrap();
                params.hosts_file_path = Some(blocker.join("hosts"));
            }
            Failure::TrafficMonitor => h.mocks.firewall.fail_create(true),
        }

        let err = h
            .manager
            .add_instance_to_network("i1", "n1", params)
            .await
            .expect_err(&format!("{:?} should fail the attach", failure));
        assert!(
            matches!(err, NetworkError::Stage { .. }),
            "{:?}: error without stage context: {}",
            failure,
            err
        );

        assert_clean(&h, "i1", "n1");
        assert_eq!(h.mocks.runtime.attachment_count(), 0, "{:?}", failure);
        assert_eq!(h.mocks.firewall.chain_count(), 2, "{:?}", failure);
        assert!(h.mocks.host.removed().contains(&"br-n1".to_string()), "{:?}", failure);

        h.mocks.namespaces.fail_create(false);
        h.mocks.runtime.clear_failures();
        h.mocks.runtime.omit_address(false);
        h.mocks.firewall.fail_create(false);

        h.manager
            .add_instance_to_network("i1", "n1", web_params())
            .await
            .unwrap_or_else(|e| panic!("{:?}: re-attach failed: {}", failure, e));
        assert!(h.manager.get_instance_ip("i1", "n1").is_ok());
    }
}

#[tokio::test]
async fn test_no_address_is_config_error() {
    let h = harness(false).await;
    h.mocks.runtime.omit_address(true);

    let err = h
        .manager
        .add_instance_to_network("i1", "n1", NetworkParams::default())
        .await
        .unwrap_err();

    assert!(matches!(err.root_cause(), NetworkError::NoAddress(_)));
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[tokio::test]
async fn test_rollback_keeps_network_of_other_instances() {
    let h = harness(false).await;

    h.manager
        .add_instance_to_network("i1", "n1", NetworkParams::default())
        .await
        .unwrap();
    let subnet = h.manager.network_subnet("n1").unwrap();

    h.mocks.runtime.fail_on(RuntimeOp::Add);
    assert!(h
        .manager
        .add_instance_to_network("i2", "n1", NetworkParams::default())
        .await
        .is_err());

    assert_eq!(h.manager.network_subnet("n1").unwrap(), subnet);
    assert_eq!(h.manager.instances_in_network("n1").unwrap(), vec!["i1".to_string()]);
    assert!(h.mocks.host.removed().is_empty());
}

// =============================================================================
// Detach
// =============================================================================

#[tokio::test]
async fn test_detach_is_idempotent() {
    let h = harness(false).await;

    h.manager.remove_instance_from_network("i1", "n1").await.unwrap();
    assert_eq!(h.mocks.runtime.del_calls(), 0);

    h.manager
        .add_instance_to_network("i1", "n1", web_params())
        .await
        .unwrap();

    h.manager.remove_instance_from_network("i1", "n1").await.unwrap();
    h.manager.remove_instance_from_network("i1", "n1").await.unwrap();

    assert_clean(&h, "i1", "n1");
    assert_eq!(h.mocks.runtime.del_calls(), 1);
    assert_eq!(h.mocks.host.removed(), vec!["br-n1".to_string()]);
    assert!(!h.path("work/cni/networks/n1").exists());
}

#[tokio::test]
async fn test_network_torn_down_with_last_instance() {
    let h = harness(false).await;

    for id in ["i1", "i2"] {
        h.manager
            .add_instance_to_network(id, "n1", NetworkParams::default())
            .await
            .unwrap();
    }
    assert_eq!(
        h.manager.get_instance_ip("i2", "n1").unwrap(),
        "172.17.0.3".parse::<std::net::IpAddr>().unwrap()
    );

    h.manager.remove_instance_from_network("i1", "n1").await.unwrap();
    assert!(h.manager.network_subnet("n1").unwrap().is_some());
    assert!(h.mocks.host.removed().is_empty());

    h.manager.remove_instance_from_network("i2", "n1").await.unwrap();
    assert!(h.manager.network_subnet("n1").unwrap().is_none());
    assert_eq!(h.mocks.host.removed(), vec!["br-n1".to_string()]);
}

#[tokio::test]
async fn test_failed_detach_keeps_attachment() {
    let h = harness(true).await;
    let (in_chain, _) = instance_chains("i1");

    h.manager
        .add_instance_to_network("i1", "n1", NetworkParams::default().with_traffic_limits(1_000, 0))
        .await
        .unwrap();

    h.mocks.firewall.set_counter(&in_chain, 5_000);
    h.manager.update_traffic().await.unwrap();
    assert!(h.mocks.firewall.is_dropping(&in_chain));

    h.mocks.runtime.fail_on(RuntimeOp::Del);
    let err = h.manager.remove_instance_from_network("i1", "n1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert!(h.manager.get_instance_ip("i1", "n1").is_ok());

    // Still metered and still capped.
    assert_eq!(h.manager.get_instance_traffic("i1").await.unwrap().input, 5_000);
    assert!(h.mocks.firewall.has_chain(&in_chain));
    assert!(h.mocks.firewall.is_dropping(&in_chain));

    h.mocks.runtime.clear_failures();
    h.manager.remove_instance_from_network("i1", "n1").await.unwrap();
    assert_clean(&h, "i1", "n1");
    assert!(!h.mocks.firewall.has_chain(&in_chain));
}

#[tokio::test]
async fn test_namespace_destroy_failure_does_not_block_detach() {
    let h = harness(false).await;

    h.manager
        .add_instance_to_network("i1", "n1", NetworkParams::default())
        .await
        .unwrap();

    h.mocks.namespaces.fail_destroy(true);
    h.manager.remove_instance_from_network("i1", "n1").await.unwrap();

    assert!(h.manager.instances_in_network("n1").unwrap().is_empty());
    assert!(!h.mocks.runtime.is_attached("n1", "i1"));
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn test_concurrent_attach_of_same_pair() {
    let h = harness(false).await;
    h.mocks.runtime.set_add_delay(Duration::from_millis(50));

    let (first, second) = tokio::join!(
        h.manager.add_instance_to_network("i1", "n1", NetworkParams::default()),
        h.manager.add_instance_to_network("i1", "n1", NetworkParams::default()),
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(NetworkError::AlreadyAttached { .. }))));
    assert_eq!(h.mocks.runtime.add_calls(), 1);
    assert_eq!(h.manager.instances_in_network("n1").unwrap(), vec!["i1".to_string()]);
}

#[tokio::test]
async fn test_detach_during_attach() {
    let h = harness(false).await;
    h.mocks.runtime.set_add_delay(Duration::from_millis(100));

    let (attach, detach) = tokio::join!(
        h.manager.add_instance_to_network("i1", "n1", NetworkParams::default()),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.manager.remove_instance_from_network("i1", "n1").await
        },
    );

    attach.unwrap();
    assert!(matches!(detach, Err(NetworkError::AttachInProgress { .. })));
    assert!(h.manager.get_instance_ip("i1", "n1").is_ok());
}

#[tokio::test]
async fn test_concurrent_networks_get_disjoint_subnets() {
    let h = harness(false).await;

    let attaches = (0..20).map(|i| {
        let manager = &h.manager;
        async move {
            manager
                .add_instance_to_network(&format!("i{}", i), &format!("n{}", i), NetworkParams::default())
                .await
        }
    });
    for result in futures::future::join_all(attaches).await {
        result.unwrap();
    }

    let subnets: Vec<Ipv4Net> = (0..20)
        .map(|i| h.manager.network_subnet(&format!("n{}", i)).unwrap().unwrap())
        .collect();

    for (i, a) in subnets.iter().enumerate() {
        for b in subnets.iter().skip(i + 1) {
            assert!(!a.contains(b) && !b.contains(a), "{} overlaps {}", a, b);
        }
    }
}

/// Test that tearing one network down does not hold up attaches elsewhere.
#[tokio::test]
async fn test_teardown_does_not_block_other_networks() {
    let h = harness(false).await;

    for (instance, network) in [("i1", "n1"), ("i9", "n9")] {
        h.manager
            .add_instance_to_network(instance, network, NetworkParams::default())
            .await
            .unwrap();
    }
    h.mocks.host.set_remove_delay(Duration::from_millis(300));

    let (teardown, attached_during_teardown) = tokio::join!(
        h.manager.remove_instance_from_network("i9", "n9"),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.manager
                .add_instance_to_network("i2", "n1", NetworkParams::default())
                .await
                .unwrap();
            h.manager
                .add_instance_to_network("i3", "n3", NetworkParams::default())
                .await
                .unwrap();
            !h.mocks.host.removed().contains(&"br-n9".to_string())
        },
    );

    teardown.unwrap();
    assert!(attached_during_teardown);
    assert!(h.manager.network_subnet("n9").unwrap().is_none());
    assert_eq!(
        h.manager.instances_in_network("n1").unwrap(),
        vec!["i1".to_string(), "i2".to_string()]
    );
}

/// Test that a network can be re-created right after its teardown.
#[tokio::test]
async fn test_network_recreated_after_teardown() {
    let h = harness(false).await;

    h.manager
        .add_instance_to_network("i1", "n1", NetworkParams::default())
        .await
        .unwrap();
    h.mocks.host.set_remove_delay(Duration::from_millis(100));

    let (detach, attach) = tokio::join!(
        h.manager.remove_instance_from_network("i1", "n1"),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.manager
                .add_instance_to_network("i2", "n1", NetworkParams::default())
                .await
        },
    );

    detach.unwrap();
    attach.unwrap();
    assert_eq!(h.manager.instances_in_network("n1").unwrap(), vec!["i2".to_string()]);
    assert!(h.manager.network_subnet("n1").unwrap().is_some());
}

#[tokio::test]
async fn test_existing_bridge_subnet_adopted() {
    let h = harness(false).await;
    h.mocks
        .host
        .add_bridge("br-n9", "10.10.5.1/24".parse().unwrap());

    h.manager
        .add_instance_to_network("i1", "n9", NetworkParams::default())
        .await
        .unwrap();

    assert_eq!(
        h.manager.network_subnet("n9").unwrap(),
        Some("10.10.5.0/24".parse().unwrap())
    );
    assert_eq!(
        h.manager.get_instance_ip("i1", "n9").unwrap(),
        "10.10.5.2".parse::<std::net::IpAddr>().unwrap()
    );
}

// =============================================================================
// Traffic
// =============================================================================

#[tokio::test]
async fn test_traffic_disabled_without_store() {
    let h = harness(false).await;

    assert!(matches!(
        h.manager.get_system_traffic().await,
        Err(NetworkError::TrafficMonitoringDisabled)
    ));
    assert!(matches!(
        h.manager.get_instance_traffic("i1").await,
        Err(NetworkError::TrafficMonitoringDisabled)
    ));
    assert!(matches!(
        h.manager.set_traffic_period(1).await,
        Err(NetworkError::TrafficMonitoringDisabled)
    ));
}

#[tokio::test]
async fn test_invalid_traffic_period_keeps_current() {
    let h = harness(true).await;

    let err = h.manager.set_traffic_period(9).await.unwrap_err();
    assert!(matches!(err, NetworkError::InvalidTrafficPeriod(_)));
    assert_eq!(h.manager.traffic_period().await.unwrap(), TrafficPeriod::Day);

    h.manager.set_traffic_period(3).await.unwrap();
    assert_eq!(h.manager.traffic_period().await.unwrap(), TrafficPeriod::Month);
}

#[tokio::test]
async fn test_instance_traffic_accounting() {
    let h = harness(true).await;
    let (in_chain, out_chain) = instance_chains("i1");

    h.manager
        .add_instance_to_network("i1", "n1", NetworkParams::default().with_traffic_limits(1_000, 0))
        .await
        .unwrap();
    assert_eq!(
        h.mocks.firewall.accounted_address(&in_chain),
        Some("172.17.0.2".to_string())
    );

    h.mocks.firewall.set_counter(&in_chain, 400);
    h.mocks.firewall.set_counter(&out_chain, 150);
    h.mocks.firewall.set_counter(SYSTEM_IN_CHAIN, 5_000);
    h.manager.update_traffic().await.unwrap();

    let usage = h.manager.get_instance_traffic("i1").await.unwrap();
    assert_eq!((usage.input, usage.output), (400, 150));
    assert_eq!(h.manager.get_system_traffic().await.unwrap().input, 5_000);
    assert!(!h.mocks.firewall.is_dropping(&in_chain));

    h.mocks.firewall.set_counter(&in_chain, 1_200);
    h.manager.update_traffic().await.unwrap();
    assert!(h.mocks.firewall.is_dropping(&in_chain));

    h.manager.remove_instance_from_network("i1", "n1").await.unwrap();
    assert!(!h.mocks.firewall.has_chain(&in_chain));
    assert!(matches!(
        h.manager.get_instance_traffic("i1").await,
        Err(NetworkError::TrafficChainNotFound(_))
    ));
    assert_eq!(h.store.get(&in_chain).unwrap().total, 1_200);
}

#[tokio::test]
async fn test_close_persists_system_counters() {
    let h = harness(true).await;

    h.mocks.firewall.set_counter(SYSTEM_OUT_CHAIN, 77);
    h.manager.close().await.unwrap();

    assert_eq!(h.store.get(SYSTEM_OUT_CHAIN).unwrap().current, 77);
    assert!(h.store.get(SYSTEM_IN_CHAIN).is_some());
}

// =============================================================================
// Startup sweep
// =============================================================================

#[tokio::test]
async fn test_startup_sweeps_leftover_networks() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir);
    let mocks = MockNetwork::new(dir.path().join("netns"));

    // State of a previous run: one attached instance in n1, junk in n2.
    let n1 = config.network_dir().join("n1");
    std::fs::create_dir_all(&n1).unwrap();
    std::fs::write(n1.join("lock"), "").unwrap();
    std::fs::write(n1.join("last_reserved_ip.0"), "172.17.0.2").unwrap();
    std::fs::write(n1.join("172.17.0.2"), "i1\r\neth0").unwrap();

    let n2 = config.network_dir().join("n2");
    std::fs::create_dir_all(&n2).unwrap();
    std::fs::write(n2.join("172.17.1.2"), "unexpected\ncontent\nhere").unwrap();

    let lease = SubnetLease::new("172.17.0.0/24".parse().unwrap()).unwrap();
    let chain = plugins::build_network_config(
        &config.cni_version,
        &config.network_dir(),
        "i1",
        "n1",
        &lease,
        &NetworkParams::default(),
    )
    .unwrap();
    let rt = plugins::runtime_conf(&mocks.namespaces.path("i1"), "i1", "n1", &[]);
    mocks.runtime.add(&chain, &rt).await.unwrap();
    mocks.namespaces.create("i1").await.unwrap();
    mocks.host.add_bridge("br-n1", "172.17.0.1/24".parse().unwrap());

    let manager = NetworkManager::new(config.clone(), mocks.backends(), None)
        .await
        .expect("Manager must start over leftover state");

    assert!(!mocks.runtime.is_attached("n1", "i1"));
    assert!(!mocks.namespaces.exists("i1"));
    assert!(!mocks.host.has_bridge("br-n1"));
    assert!(mocks.host.removed().contains(&"br-n2".to_string()));
    assert!(!config.cni_dir().exists());

    manager
        .add_instance_to_network("i1", "n1", NetworkParams::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_startup_without_previous_state() {
    let dir = tempfile::tempdir().unwrap();
    let mocks = MockNetwork::new(dir.path().join("netns"));

    let manager = NetworkManager::new(config_in(&dir), mocks.backends(), None).await;

    assert!(manager.is_ok());
    assert!(mocks.host.removed().is_empty());
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mocks = MockNetwork::new(dir.path().join("netns"));
    let mut config = config_in(&dir);
    config.subnets.prefix_len = 31;

    let err = NetworkManager::new(config, mocks.backends(), None).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Config);
}
