use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::subnet::Subnet;

/// Interface name of every peer's link inside its namespace.
pub const PEER_IFACE: &str = "eth0";

/// Public address used to discover the host's outbound interface.
pub const EGRESS_PROBE_ADDR: &str = "1.1.1.1";

/// Linux netdev name limit.
pub const IFNAMSIZ: usize = 15;

/// Somewhere commands can run: the host namespace or a peer namespace.
pub trait NetContext {
    fn label(&self) -> &str;

    /// Run a command, returning raw output.
    fn exec(&self, cmd: &str, args: &[&str]) -> Result<Output>;

    /// Run a command, failing if it exits non-zero.
    fn exec_checked(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        let output = self.exec(cmd, args)?;
        if !output.status.success() {
            bail!(
                "command failed in {}: {cmd} {}\n{}",
                self.label(),
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output)
    }
}

/// The host (root) network namespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct Host;

impl NetContext for Host {
    fn label(&self) -> &str {
        "host"
    }

    fn exec(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        let mut full_args = vec![cmd];
        full_args.extend_from_slice(args);
        sudo(&full_args)
    }
}

/// A Linux network namespace.
///
/// Deletion is explicit ([`Namespace::delete`]); the owning topology decides
/// when the namespace goes away.
#[derive(Debug, Clone)]
pub struct Namespace {
    pub name: String,
}

impl Namespace {
    /// Create the namespace and bring up loopback.
    pub fn create(name: &str) -> Result<Self> {
        // Stale namespace with the same name (idempotent)
        let _ = sudo(&["ip", "netns", "del", name]);

        sudo_checked(&["ip", "netns", "add", name])
            .with_context(|| format!("create netns '{name}'"))?;

        debug!(ns = name, "created network namespace");

        let ns = Self::attach(name);
        ns.exec_checked("ip", &["link", "set", "lo", "up"])
            .with_context(|| format!("bring up loopback in '{name}'"))?;
        Ok(ns)
    }

    /// Handle for a namespace that already exists (or may not).
    pub fn attach(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// Best-effort delete; a missing namespace is not an error.
    pub fn delete(&self) {
        match sudo(&["ip", "netns", "del", &self.name]) {
            Ok(out) if out.status.success() => debug!(ns = self.name, "deleted network namespace"),
            Ok(_) => debug!(ns = self.name, "namespace already gone"),
            Err(err) => warn!(ns = self.name, "failed to delete namespace: {err:#}"),
        }
    }
}

impl NetContext for Namespace {
    fn label(&self) -> &str {
        &self.name
    }

    fn exec(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        let mut full_args = vec!["ip", "netns", "exec", &self.name, cmd];
        full_args.extend_from_slice(args);
        sudo(&full_args).with_context(|| format!("exec '{cmd}' in ns '{}'", self.name))
    }
}

/// Names and addressing for a bridge topology of `peer_count` peers.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    pub peer_count: usize,
    pub subnet: Subnet,
    pub bridge: String,
    /// Namespace `i` is `{ns_prefix}{i}`; its host-side veth is `{ns_prefix}{i}h`.
    pub ns_prefix: String,
}

impl TopologyConfig {
    pub fn namespace_name(&self, index: usize) -> String {
        format!("{}{index}", self.ns_prefix)
    }

    pub fn host_iface(&self, index: usize) -> String {
        format!("{}{index}h", self.ns_prefix)
    }

    /// Check names against the netdev limit and addresses against the subnet.
    pub fn validate(&self) -> Result<()> {
        if self.peer_count == 0 {
            bail!("topology needs at least one peer");
        }
        if self.peer_count > self.subnet.max_peers() {
            bail!(
                "{} peers do not fit in {} (max {})",
                self.peer_count,
                self.subnet,
                self.subnet.max_peers()
            );
        }
        if self.bridge.is_empty() || self.bridge.len() > IFNAMSIZ {
            bail!("bridge name '{}' must be 1..={IFNAMSIZ} chars", self.bridge);
        }
        if self.ns_prefix.is_empty()
            || !self
                .ns_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            bail!("namespace prefix '{}' must be non-empty [A-Za-z0-9_-]", self.ns_prefix);
        }
        let longest = self.host_iface(self.peer_count);
        if longest.len() > IFNAMSIZ {
            bail!("interface name '{longest}' exceeds {IFNAMSIZ} chars; shorten the prefix");
        }
        Ok(())
    }
}

/// One peer's slot in the topology.
#[derive(Debug, Clone)]
pub struct PeerLink {
    pub index: usize,
    pub namespace: Namespace,
    pub host_iface: String,
    pub address: Ipv4Addr,
}

/// Options for host internet egress.
#[derive(Debug, Clone, Default)]
pub struct EgressConfig {
    /// Nameserver written to `/etc/netns/<ns>/resolv.conf` for every peer.
    pub dns: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IptablesRule {
    table: Option<&'static str>,
    chain: &'static str,
    spec: Vec<String>,
}

impl IptablesRule {
    fn args(&self, op: &'static str) -> Vec<String> {
        let mut args = Vec::with_capacity(self.spec.len() + 4);
        if let Some(table) = self.table {
            args.extend(["-t".to_string(), table.to_string()]);
        }
        args.push(op.to_string());
        args.push(self.chain.to_string());
        args.extend(self.spec.iter().cloned());
        args
    }
}

#[derive(Debug, Default)]
struct EgressState {
    inserted: Vec<IptablesRule>,
    dns_dirs: Vec<String>,
}

/// A shared bridge with one namespace per peer, each attached by a veth pair.
///
/// Only one topology should be live at a time: [`BridgeTopology::build`]
/// first removes whatever a previous run with the same names left behind.
#[derive(Debug)]
pub struct BridgeTopology {
    config: TopologyConfig,
    peers: Vec<PeerLink>,
    egress: Option<EgressState>,
}

impl BridgeTopology {
    /// Plan the topology without touching the system.
    pub fn new(config: TopologyConfig) -> Result<Self> {
        config.validate()?;
        let peers = (1..=config.peer_count)
            .map(|index| {
                Ok(PeerLink {
                    index,
                    namespace: Namespace::attach(&config.namespace_name(index)),
                    host_iface: config.host_iface(index),
                    address: config.subnet.peer_address(index)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            peers,
            egress: None,
        })
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub fn peers(&self) -> &[PeerLink] {
        &self.peers
    }

    pub fn peer(&self, index: usize) -> Option<&PeerLink> {
        index.checked_sub(1).and_then(|i| self.peers.get(i))
    }

    pub fn bridge_name(&self) -> &str {
        &self.config.bridge
    }

    /// Create bridge, namespaces, veth links, addresses and default routes.
    pub fn build(&mut self) -> Result<()> {
        self.remove_substrate();

        let subnet = self.config.subnet;
        let bridge = self.config.bridge.as_str();
        let gateway_cidr = subnet.cidr_of(subnet.gateway());

        sudo_checked(&["ip", "link", "add", "name", bridge, "type", "bridge"])
            .with_context(|| format!("create bridge '{bridge}'"))?;
        sudo_checked(&["ip", "addr", "add", &gateway_cidr, "dev", bridge])
            .context("assign bridge gateway address")?;
        sudo_checked(&["ip", "link", "set", bridge, "up"]).context("bring bridge up")?;
        debug!(bridge, gateway = %gateway_cidr, "bridge ready");

        let gateway = subnet.gateway().to_string();
        for peer in &self.peers {
            let ns = Namespace::create(&peer.namespace.name)?;
            let host_iface = peer.host_iface.as_str();

            sudo_checked(&[
                "ip", "link", "add", host_iface, "type", "veth", "peer", "name", PEER_IFACE,
                "netns", &ns.name,
            ])
            .with_context(|| format!("create veth for peer {}", peer.index))?;
            sudo_checked(&["ip", "link", "set", host_iface, "master", bridge])
                .context("attach veth to bridge")?;
            sudo_checked(&["ip", "link", "set", host_iface, "up"]).context("bring veth up")?;

            let cidr = subnet.cidr_of(peer.address);
            ns.exec_checked("ip", &["addr", "add", &cidr, "dev", PEER_IFACE])
                .context("set peer address")?;
            ns.exec_checked("ip", &["link", "set", PEER_IFACE, "up"])
                .context("bring peer link up")?;
            ns.exec_checked("ip", &["route", "add", "default", "via", &gateway])
                .context("install default route")?;

            debug!(peer = peer.index, ns = ns.name, address = %peer.address, "peer linked");
        }

        info!(
            peers = self.peers.len(),
            bridge,
            subnet = %subnet,
            "topology built"
        );
        Ok(())
    }

    /// Let peer namespaces reach the outside world through the host.
    ///
    /// Rules are only inserted when `iptables -C` reports them missing, and
    /// only rules inserted here are removed again on teardown.
    pub fn enable_egress(&mut self, egress: &EgressConfig) -> Result<()> {
        let host = Host;
        let route = host
            .exec_checked("ip", &["route", "get", EGRESS_PROBE_ADDR])
            .context("query route to public address")?;
        let outbound = parse_route_dev(&String::from_utf8_lossy(&route.stdout))
            .context("could not detect outbound interface")?;

        host.exec_checked("sysctl", &["-w", "net.ipv4.ip_forward=1"])
            .context("enable IPv4 forwarding")?;

        let rules = egress_rules(&self.config.subnet, &self.config.bridge, &outbound);
        let namespaces: Vec<String> = self
            .peers
            .iter()
            .map(|peer| peer.namespace.name.clone())
            .collect();
        // Recorded before the first change so teardown sees partial progress
        let state = self.egress.get_or_insert_with(EgressState::default);
        install_egress(&host, rules, egress.dns, &namespaces, state)?;

        info!(
            outbound = %outbound,
            rules_added = state.inserted.len(),
            dns = ?egress.dns,
            "internet egress enabled"
        );
        Ok(())
    }

    /// Undo [`build`](Self::build) and [`enable_egress`](Self::enable_egress).
    ///
    /// Every step is best-effort and safe on a substrate that does not exist.
    pub fn teardown(&mut self) {
        if let Some(state) = self.egress.take() {
            remove_egress(&Host, &state);
        }
        self.remove_substrate();
        info!(bridge = self.config.bridge, "topology torn down");
    }

    /// Remove this topology's names plus any `{ns_prefix}<n>` namespace or
    /// `{ns_prefix}<n>h` link a larger earlier run left behind.
    fn remove_substrate(&self) {
        let prefix = self.config.ns_prefix.as_str();
        let mut namespaces: BTreeSet<String> =
            self.peers.iter().map(|p| p.namespace.name.clone()).collect();
        let mut links: BTreeSet<String> = self.peers.iter().map(|p| p.host_iface.clone()).collect();

        match sudo_checked(&["ip", "netns", "list"]) {
            Ok(out) => namespaces.extend(stale_namespaces(&String::from_utf8_lossy(&out.stdout), prefix)),
            Err(err) => debug!("cannot list namespaces: {err:#}"),
        }
        match sudo_checked(&["ip", "-o", "link", "show"]) {
            Ok(out) => links.extend(stale_links(&String::from_utf8_lossy(&out.stdout), prefix)),
            Err(err) => debug!("cannot list links: {err:#}"),
        }

        for name in &namespaces {
            Namespace::attach(name).delete();
        }
        // Usually gone with the namespace; a half-built run may leave them
        for link in &links {
            let _ = sudo(&["ip", "link", "del", link]);
        }
        let _ = sudo(&["ip", "link", "del", &self.config.bridge]);
    }
}

/// Insert missing egress rules and per-namespace resolv.conf files,
/// recording each change in `state` as soon as it is made.
fn install_egress(
    host: &dyn NetContext,
    rules: Vec<IptablesRule>,
    dns: Option<Ipv4Addr>,
    namespaces: &[String],
    state: &mut EgressState,
) -> Result<()> {
    for rule in rules {
        let check = rule.args("-C");
        let check: Vec<&str> = check.iter().map(String::as_str).collect();
        if host.exec("iptables", &check)?.status.success() {
            debug!(chain = rule.chain, "iptables rule already present");
            continue;
        }
        let add = rule.args("-A");
        let add: Vec<&str> = add.iter().map(String::as_str).collect();
        host.exec_checked("iptables", &add)
            .with_context(|| format!("insert {} rule", rule.chain))?;
        state.inserted.push(rule);
    }

    if let Some(dns) = dns {
        for ns in namespaces {
            let dir = format!("/etc/netns/{ns}");
            host.exec_checked("mkdir", &["-p", &dir])
                .context("create netns resolv dir")?;
            state.dns_dirs.push(dir.clone());
            let script = format!("echo 'nameserver {dns}' > {dir}/resolv.conf");
            host.exec_checked("sh", &["-c", &script])
                .context("write netns resolv.conf")?;
        }
    }
    Ok(())
}

/// Reverse [`install_egress`]: rules newest first, then resolv dirs.
fn remove_egress(host: &dyn NetContext, state: &EgressState) {
    for rule in state.inserted.iter().rev() {
        let del = rule.args("-D");
        let del: Vec<&str> = del.iter().map(String::as_str).collect();
        if let Err(err) = host.exec_checked("iptables", &del) {
            warn!("failed to remove {} rule: {err:#}", rule.chain);
        }
    }
    for dir in &state.dns_dirs {
        let _ = host.exec("rm", &["-rf", dir]);
    }
}

/// Peer index encoded in `name` as `{prefix}<digits>{suffix}`.
fn owned_index(name: &str, prefix: &str, suffix: &str) -> Option<usize> {
    let digits = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Namespaces in `ip netns list` output that follow the peer naming scheme.
fn stale_namespaces(listing: &str, prefix: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|name| owned_index(name, prefix, "").is_some())
        .map(str::to_string)
        .collect()
}

/// Host-side veths in `ip -o link show` output that follow the naming scheme.
fn stale_links(listing: &str, prefix: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.split(": ").nth(1))
        .map(|name| name.split('@').next().unwrap_or(name))
        .filter(|name| owned_index(name, prefix, "h").is_some())
        .map(str::to_string)
        .collect()
}

fn egress_rules(subnet: &Subnet, bridge: &str, outbound: &str) -> Vec<IptablesRule> {
    let source = subnet.to_string();
    let spec = |parts: &[&str]| parts.iter().map(|p| p.to_string()).collect::<Vec<_>>();
    vec![
        IptablesRule {
            table: Some("nat"),
            chain: "POSTROUTING",
            spec: spec(&["-s", &source, "-o", outbound, "-j", "MASQUERADE"]),
        },
        IptablesRule {
            table: None,
            chain: "FORWARD",
            spec: spec(&["-i", bridge, "-o", outbound, "-j", "ACCEPT"]),
        },
        IptablesRule {
            table: None,
            chain: "FORWARD",
            spec: spec(&[
                "-i",
                outbound,
                "-o",
                bridge,
                "-m",
                "state",
                "--state",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
            ]),
        },
    ]
}

/// Extract the `dev <iface>` field from `ip route get` output.
pub fn parse_route_dev(output: &str) -> Option<String> {
    let mut words = output.split_whitespace();
    while let Some(word) = words.next() {
        if word == "dev" {
            return words.next().map(str::to_string);
        }
    }
    None
}

/// Whether a network namespace called `name` currently exists.
pub fn namespace_exists(name: &str) -> Result<bool> {
    let out = sudo_checked(&["ip", "netns", "list"])?;
    Ok(String::from_utf8_lossy(&out.stdout)
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|ns| ns == name))
}

/// Whether a link called `name` exists in the host namespace.
pub fn link_exists(name: &str) -> Result<bool> {
    Ok(sudo(&["ip", "link", "show", name])?.status.success())
}

// -- helpers --

/// Run `sudo <args>`, returning raw output.
pub(crate) fn sudo(args: &[&str]) -> Result<Output> {
    Command::new("sudo")
        .args(args)
        .output()
        .with_context(|| format!("sudo {}", args.join(" ")))
}

/// Run `sudo <args>`, returning output on success or bailing with stderr.
pub(crate) fn sudo_checked(args: &[&str]) -> Result<Output> {
    let output = sudo(args)?;
    if !output.status.success() {
        bail!(
            "command failed: sudo {}\n{}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output)
}
