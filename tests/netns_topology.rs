//! Real namespace substrate tests.
//!
//! Builds the bridge topology, runs the orchestrator against a shell
//! stand-in for the peer binary, and checks teardown leaves nothing behind.
//! Skipped without passwordless sudo.

mod common;

use std::fs;
use std::time::Duration;

use gossip_lab::peer::PeerInvocation;
use gossip_lab::{
    CancelToken, DiscoveryMode, NetnsLauncher, NetnsTestbed, Orchestrator, Role, RunDir,
    RunSettings, TestbedGuard,
};
use network_sim::topology::{link_exists, namespace_exists};
use network_sim::{BridgeTopology, NetContext, TopologyConfig, check_binary, unique_ns_name};

fn topology_config(peers: usize) -> TopologyConfig {
    TopologyConfig {
        peer_count: peers,
        subnet: common::unique_subnet(),
        bridge: unique_ns_name("glb"),
        ns_prefix: format!("{}-", unique_ns_name("gt")),
    }
}

fn assert_gone(config: &TopologyConfig) {
    assert!(!link_exists(&config.bridge).unwrap(), "bridge left behind");
    for i in 1..=config.peer_count {
        let ns = config.namespace_name(i);
        assert!(!namespace_exists(&ns).unwrap(), "namespace {ns} left behind");
        assert!(!link_exists(&config.host_iface(i)).unwrap(), "veth of peer {i} left behind");
    }
}

#[test]
fn test_build_teardown_round_trip() {
    if common::skip_without_privileges() {
        return;
    }

    for peers in [1, 3] {
        let config = topology_config(peers);
        let topology = BridgeTopology::new(config.clone()).expect("plan topology");
        let mut testbed = NetnsTestbed::new(topology, None, None);

        let guard = TestbedGuard::build(&mut testbed).expect("build topology");
        assert!(link_exists(&config.bridge).unwrap());
        for peer in guard.topology().peers() {
            assert!(namespace_exists(&peer.namespace.name).unwrap());
            let out = peer
                .namespace
                .exec("ip", &["-4", "-o", "addr", "show", "dev", "eth0"])
                .unwrap();
            let shown = String::from_utf8_lossy(&out.stdout);
            assert!(
                shown.contains(&format!("{}/24", peer.address)),
                "peer {} has no address: {shown}",
                peer.index
            );
        }

        if peers > 1 && check_binary("ping").is_some() {
            let first = &guard.topology().peers()[0];
            let last = guard.topology().peers().last().unwrap();
            let out = first
                .namespace
                .exec("ping", &["-c", "1", "-W", "2", &last.address.to_string()])
                .unwrap();
            assert!(out.status.success(), "peer 1 cannot reach peer {peers}");
        }

        guard.release();
        assert_gone(&config);
    }
}

#[test]
fn test_teardown_without_build_is_harmless() {
    if common::skip_without_privileges() {
        return;
    }

    let config = topology_config(2);
    let mut topology = BridgeTopology::new(config.clone()).expect("plan topology");
    topology.teardown();
    topology.teardown();
    assert_gone(&config);
}

#[test]
fn test_run_with_script_peer() {
    if common::skip_without_privileges() {
        return;
    }

    let base = tempfile::tempdir().unwrap();
    let run_dir = RunDir::create(base.path(), "run-netns").unwrap();
    let config = topology_config(3);

    let invocation = PeerInvocation {
        binary: common::fake_peer_script().display().to_string(),
        topic: "netns-test".into(),
        discovery: DiscoveryMode::Direct,
        idle_report_ms: 500,
        messages: 10,
        rate: 10,
        payload_size: 32,
        log_level: "info".into(),
    };
    let launcher = NetnsLauncher::new(config.clone(), invocation, run_dir.clone());
    let topology = BridgeTopology::new(config.clone()).expect("plan topology");
    let mut testbed = NetnsTestbed::new(topology, None, None);

    let settings = RunSettings {
        peer_count: 3,
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let mut orch = Orchestrator::new(launcher, settings, CancelToken::new(), 5);
    orch.run(&mut testbed).expect("run completes");

    let report = orch.report();
    let id = report.node_ids.get(&1).expect("peer 1 resolved");
    assert!(id.starts_with('n'), "unexpected node id {id}");

    for peer in 1..=3 {
        let files = run_dir.peer_files(peer, Role::Receiver);
        let diagnostics = fs::read_to_string(&files.diagnostics).unwrap();
        assert!(diagnostics.contains("node_id="), "peer {peer}: {diagnostics}");
        let summary = fs::read_to_string(&files.stdout).unwrap();
        assert!(summary.contains("\"received\""), "peer {peer}: {summary}");
    }

    let sender_log = fs::read_to_string(run_dir.peer_files(1, Role::Sender).event_log).unwrap();
    assert!(sender_log.contains(id.as_str()), "sender not given bootstrap id: {sender_log}");

    assert_gone(&config);
}
