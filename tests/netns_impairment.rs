//! Network scenario tests against real qdiscs.
//!
//! Checks that each scenario lands netem on the right links and that
//! clearing removes it. Skipped without sudo, `tc` or `sch_netem`.

mod common;

use gossip_lab::{NetnsTestbed, Testbed, TestbedGuard};
use network_sim::{
    BridgeTopology, Host, NetContext, NetworkScenario, TopologyConfig, unique_ns_name,
};

fn testbed(peers: usize, clean_peer: Option<usize>) -> NetnsTestbed {
    let config = TopologyConfig {
        peer_count: peers,
        subnet: common::unique_subnet(),
        bridge: unique_ns_name("gib"),
        ns_prefix: format!("{}-", unique_ns_name("gi")),
    };
    let topology = BridgeTopology::new(config).expect("plan topology");
    NetnsTestbed::new(topology, None, clean_peer)
}

fn qdisc(ctx: &dyn NetContext, dev: &str) -> String {
    let out = ctx
        .exec_checked("tc", &["qdisc", "show", "dev", dev])
        .expect("tc qdisc show");
    String::from_utf8_lossy(&out.stdout).into_owned()
}

#[test]
fn test_loss_spares_clean_peer() {
    if common::skip_without_netem() {
        return;
    }

    let mut bed = testbed(3, Some(1));
    let mut guard = TestbedGuard::build(&mut bed).expect("build topology");
    guard
        .impair(&NetworkScenario::Loss { loss_percent: 5.0 })
        .expect("apply loss");

    let peers = guard.topology().peers().to_vec();
    assert!(!qdisc(&peers[0].namespace, "eth0").contains("netem"));
    for peer in &peers[1..] {
        let shown = qdisc(&peer.namespace, "eth0");
        assert!(shown.contains("netem"), "peer {}: {shown}", peer.index);
        assert!(shown.contains("loss 5%"), "peer {}: {shown}", peer.index);
    }

    guard.clear_impairment();
    for peer in &peers {
        assert!(!qdisc(&peer.namespace, "eth0").contains("netem"));
    }
    guard.release();
}

#[test]
fn test_loss_delay_replaces_previous_profile() {
    if common::skip_without_netem() {
        return;
    }

    let mut bed = testbed(2, None);
    let mut guard = TestbedGuard::build(&mut bed).expect("build topology");
    guard
        .impair(&NetworkScenario::Loss { loss_percent: 20.0 })
        .expect("apply loss");
    guard
        .impair(&NetworkScenario::LossDelay {
            loss_percent: 1.0,
            delay_ms: 40,
            jitter_ms: 5,
        })
        .expect("apply loss-delay");

    for peer in guard.topology().peers() {
        let shown = qdisc(&peer.namespace, "eth0");
        assert_eq!(shown.matches("netem").count(), 1, "stacked qdiscs: {shown}");
        assert!(shown.contains("delay 40"), "peer {}: {shown}", peer.index);
        assert!(!shown.contains("loss 20%"), "old profile kept: {shown}");
    }
    guard.release();
}

#[test]
fn test_delay_shapes_bridge() {
    if common::skip_without_netem() {
        return;
    }

    let mut bed = testbed(2, Some(1));
    let mut guard = TestbedGuard::build(&mut bed).expect("build topology");
    guard
        .impair(&NetworkScenario::Delay { delay_ms: 30 })
        .expect("apply delay");

    let bridge = guard.topology().bridge_name().to_string();
    assert!(qdisc(&Host, &bridge).contains("delay 30"));
    for peer in guard.topology().peers() {
        assert!(!qdisc(&peer.namespace, "eth0").contains("netem"));
    }
    guard.release();
}
