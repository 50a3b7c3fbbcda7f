//! Command-line surface and the explicit run configuration built from it.
//!
//! Everything a run needs is resolved here, once, into a [`LabConfig`] that
//! is handed to each component at construction. Nothing downstream reads
//! environment variables or relies on the working directory.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use clap::Parser;
use network_sim::{EgressConfig, NetworkScenario, Subnet, TopologyConfig};
use serde::Serialize;

use crate::bootstrap::BootstrapPolicy;
use crate::churn::{ChurnSchedule, ChurnSelection};
use crate::mode::DiscoveryMode;
use crate::orchestrator::RunSettings;
use crate::peer::PeerInvocation;
use crate::readiness::ReadinessBudget;

/// Network condition selector for `--net`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum NetKind {
    Clean,
    Delay,
    Loss,
    LossDelay,
}

#[derive(Parser, Debug)]
#[command(
    name = "gossip-lab",
    author,
    version,
    disable_version_flag = true,
    about = "Run a gossip peer binary across network namespaces with impairment and churn"
)]
pub struct Cli {
    /// Print the version and exit
    #[arg(short = 'v', long = "version", action = clap::ArgAction::SetTrue)]
    pub print_version: bool,

    /// Number of emulated peers
    #[arg(short = 'n', long = "peers", default_value_t = 5)]
    pub peers: usize,
    /// Messages the sender publishes
    #[arg(long = "num", default_value_t = 2000)]
    pub messages: u64,
    /// Sender rate in messages per second
    #[arg(long = "rate", default_value_t = 50)]
    pub rate: u32,
    /// Payload size in bytes
    #[arg(long = "size", default_value_t = 256)]
    pub payload_size: usize,
    /// Peer idle report interval in ms
    #[arg(long = "idle-report-ms", default_value_t = 3000)]
    pub idle_report_ms: u64,
    /// Gossip topic name
    #[arg(long = "topic", default_value = "gossip-lab")]
    pub topic: String,
    /// Discovery mode: direct (default) or relay
    #[arg(long = "discovery", value_enum, default_value = "direct")]
    pub discovery: DiscoveryMode,

    /// Use the N lowest-indexed peers as bootstrap peers
    #[arg(long = "bootstrap-count", conflicts_with = "bootstrap_per")]
    pub bootstrap_count: Option<usize>,
    /// One bootstrap peer per K peers (peer 1 plus random others)
    #[arg(long = "bootstrap-per", value_name = "K")]
    pub bootstrap_per: Option<usize>,
    /// Peer whose namespace runs the sender
    #[arg(long = "sender-peer", default_value_t = 1)]
    pub sender_peer: usize,

    /// Enable churn (implied by any --churn-count/--churn-pct/--churn-peers)
    #[arg(long = "churn")]
    pub churn: bool,
    /// Seconds after sender launch before churned peers go offline
    #[arg(long = "churn-start", value_name = "SECS", default_value_t = 10)]
    pub churn_start: u64,
    /// Seconds churned peers stay offline
    #[arg(long = "churn-down", value_name = "SECS", default_value_t = 10)]
    pub churn_down: u64,
    /// Churn this many random non-bootstrap peers
    #[arg(long = "churn-count", conflicts_with_all = ["churn_pct", "churn_peers"])]
    pub churn_count: Option<usize>,
    /// Churn this percentage of non-bootstrap peers (rounded up)
    #[arg(long = "churn-pct", conflicts_with = "churn_peers")]
    pub churn_pct: Option<u32>,
    /// Churn exactly these peers (comma-separated indices)
    #[arg(long = "churn-peers", value_delimiter = ',')]
    pub churn_peers: Vec<usize>,

    /// Network scenario
    #[arg(long = "net", value_enum, default_value = "clean")]
    pub net: NetKind,
    /// One-way delay in ms (delay, loss-delay)
    #[arg(long = "delay-ms", default_value_t = 100)]
    pub delay_ms: u32,
    /// Delay jitter in ms (loss-delay)
    #[arg(long = "jitter-ms", default_value_t = 20)]
    pub jitter_ms: u32,
    /// Packet loss percentage (loss, loss-delay)
    #[arg(long = "loss-pct", default_value_t = 5.0)]
    pub loss_pct: f32,
    /// Peer left unimpaired under loss scenarios
    #[arg(long = "clean-peer", default_value_t = 1, conflicts_with = "no_clean_peer")]
    pub clean_peer: usize,
    /// Impair every peer under loss scenarios
    #[arg(long = "no-clean-peer")]
    pub no_clean_peer: bool,

    /// Peer subnet; the bridge takes .1 and peer i takes .(10+i)
    #[arg(long = "subnet", default_value = "10.10.0.0/24")]
    pub subnet: Subnet,
    /// Bridge device name
    #[arg(long = "bridge", default_value = "br-glab")]
    pub bridge: String,
    /// Namespace name prefix; peer i lives in <prefix><i>
    #[arg(long = "ns-prefix", default_value = "glp")]
    pub ns_prefix: String,
    /// Give peers internet access through the host (NAT)
    #[arg(long = "internet")]
    pub internet: bool,
    /// Nameserver for peer namespaces (with --internet)
    #[arg(long = "dns", requires = "internet")]
    pub dns: Option<Ipv4Addr>,

    /// Peer binary path or name on PATH
    #[arg(long = "peer-bin", env = "GOSSIP_LAB_PEER_BIN", default_value = "gossip-peer")]
    pub peer_bin: String,
    /// RUST_LOG value for peer processes
    #[arg(long = "peer-log-level", default_value = "info")]
    pub peer_log_level: String,
    /// Base directory for run directories
    #[arg(long = "log-dir", env = "GOSSIP_LAB_LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,

    /// Readiness polls per bootstrap peer
    #[arg(long = "ready-attempts", default_value_t = 80)]
    pub ready_attempts: u32,
    /// Interval between readiness polls in ms
    #[arg(long = "ready-interval-ms", default_value_t = 250)]
    pub ready_interval_ms: u64,

    /// Seed for bootstrap and churn selection
    #[arg(long = "seed")]
    pub seed: Option<u64>,
    /// Print the resolved plan and exit without touching the system
    #[arg(long = "dry-run")]
    pub dry_run: bool,
}

impl Cli {
    fn bootstrap_policy(&self) -> BootstrapPolicy {
        match (self.bootstrap_count, self.bootstrap_per) {
            (Some(n), _) => BootstrapPolicy::Fixed(n),
            (None, Some(k)) => BootstrapPolicy::PerGroup(k),
            (None, None) => BootstrapPolicy::Single,
        }
    }

    fn churn_schedule(&self) -> Option<ChurnSchedule> {
        let selection = if !self.churn_peers.is_empty() {
            ChurnSelection::Fixed(self.churn_peers.clone())
        } else if let Some(n) = self.churn_count {
            ChurnSelection::Count(n)
        } else if let Some(pct) = self.churn_pct {
            ChurnSelection::Percent(pct)
        } else if self.churn {
            ChurnSelection::Half
        } else {
            return None;
        };
        Some(ChurnSchedule {
            start: Duration::from_secs(self.churn_start),
            down: Duration::from_secs(self.churn_down),
            selection,
        })
    }

    fn network(&self) -> NetworkScenario {
        match self.net {
            NetKind::Clean => NetworkScenario::Clean,
            NetKind::Delay => NetworkScenario::Delay {
                delay_ms: self.delay_ms,
            },
            NetKind::Loss => NetworkScenario::Loss {
                loss_percent: self.loss_pct,
            },
            NetKind::LossDelay => NetworkScenario::LossDelay {
                loss_percent: self.loss_pct,
                delay_ms: self.delay_ms,
                jitter_ms: self.jitter_ms,
            },
        }
    }
}

/// Fully resolved configuration for one run.
#[derive(Debug, Clone)]
pub struct LabConfig {
    pub topology: TopologyConfig,
    pub egress: Option<EgressConfig>,
    /// Peer exempt from loss impairment.
    pub clean_peer: Option<usize>,
    pub peer: PeerInvocation,
    pub run: RunSettings,
    pub log_dir: PathBuf,
    pub seed: Option<u64>,
    pub dry_run: bool,
}

impl LabConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let config = Self {
            topology: TopologyConfig {
                peer_count: cli.peers,
                subnet: cli.subnet,
                bridge: cli.bridge.clone(),
                ns_prefix: cli.ns_prefix.clone(),
            },
            egress: cli.internet.then(|| EgressConfig { dns: cli.dns }),
            clean_peer: (!cli.no_clean_peer).then_some(cli.clean_peer),
            peer: PeerInvocation {
                binary: cli.peer_bin.clone(),
                topic: cli.topic.clone(),
                discovery: cli.discovery,
                idle_report_ms: cli.idle_report_ms,
                messages: cli.messages,
                rate: cli.rate,
                payload_size: cli.payload_size,
                log_level: cli.peer_log_level.clone(),
            },
            run: RunSettings {
                peer_count: cli.peers,
                sender_peer: cli.sender_peer,
                bootstrap: cli.bootstrap_policy(),
                churn: cli.churn_schedule(),
                network: cli.network(),
                readiness: ReadinessBudget {
                    attempts: cli.ready_attempts,
                    interval: Duration::from_millis(cli.ready_interval_ms),
                },
                ..Default::default()
            },
            log_dir: cli.log_dir.clone(),
            seed: cli.seed,
            dry_run: cli.dry_run,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings before anything touches the system.
    pub fn validate(&self) -> Result<()> {
        let peers = self.run.peer_count;
        ensure!(peers >= 1, "need at least one peer");
        ensure!(
            self.topology.peer_count == peers,
            "topology sized for {} peers, run for {peers}",
            self.topology.peer_count
        );
        self.topology.validate()?;

        ensure!(
            (1..=peers).contains(&self.run.sender_peer),
            "sender peer {} is outside 1..={peers}",
            self.run.sender_peer
        );
        if let Some(clean) = self.clean_peer {
            ensure!(
                (1..=peers).contains(&clean),
                "clean peer {clean} is outside 1..={peers}"
            );
        }

        match self.run.bootstrap {
            BootstrapPolicy::Fixed(0) => bail!("bootstrap count must be at least 1"),
            BootstrapPolicy::PerGroup(0) => bail!("bootstrap group size must be at least 1"),
            _ => {}
        }

        if let Some(churn) = &self.run.churn {
            match &churn.selection {
                ChurnSelection::Percent(pct) if !(1..=100).contains(pct) => {
                    bail!("churn percentage {pct} is outside 1..=100")
                }
                ChurnSelection::Fixed(list) if list.iter().any(|&p| p == 0 || p > peers) => {
                    bail!("churn peers {list:?} must be within 1..={peers}")
                }
                ChurnSelection::Fixed(_) => {
                    if let Some(bootstrap) = self.run.bootstrap.fixed_set(peers) {
                        churn.selection.check(peers, &bootstrap)?;
                    }
                }
                _ => {}
            }
        }

        let readiness = self.run.readiness;
        ensure!(readiness.attempts >= 1, "readiness attempts must be at least 1");
        ensure!(
            !readiness.interval.is_zero(),
            "readiness interval must be positive"
        );

        self.run.network.profile().config().validate()?;

        ensure!(!self.peer.binary.is_empty(), "peer binary must be set");
        ensure!(!self.peer.topic.is_empty(), "topic must be set");
        Ok(())
    }

    /// Extra system tools this configuration needs beyond `ip`.
    pub fn required_tools(&self) -> Vec<&'static str> {
        let mut tools = Vec::new();
        if !matches!(self.run.network, NetworkScenario::Clean) {
            tools.push("tc");
        }
        if self.egress.is_some() {
            tools.extend(["iptables", "sysctl"]);
        }
        tools
    }

    pub fn parameters(&self) -> RunParameters {
        RunParameters {
            peers: self.run.peer_count,
            messages: self.peer.messages,
            rate: self.peer.rate,
            payload_size: self.peer.payload_size,
            idle_report_ms: self.peer.idle_report_ms,
            discovery: self.peer.discovery,
            topic: self.peer.topic.clone(),
            network: self.run.network.name().to_string(),
            impairment: self.run.network.profile().to_string(),
            clean_peer: self.clean_peer,
            bootstrap: self.run.bootstrap.to_string(),
            sender_peer: self.run.sender_peer,
            churn: self.run.churn.as_ref().map(|c| ChurnParameters {
                start_secs: c.start.as_secs(),
                down_secs: c.down.as_secs(),
                selection: c.selection.to_string(),
            }),
            subnet: self.topology.subnet.to_string(),
            internet: self.egress.is_some(),
            peer_binary: self.peer.binary.clone(),
        }
    }
}

/// Run parameters as recorded in the manifest and run id.
#[derive(Debug, Clone, Serialize)]
pub struct RunParameters {
    pub peers: usize,
    pub messages: u64,
    pub rate: u32,
    pub payload_size: usize,
    pub idle_report_ms: u64,
    pub discovery: DiscoveryMode,
    pub topic: String,
    pub network: String,
    pub impairment: String,
    pub clean_peer: Option<usize>,
    pub bootstrap: String,
    pub sender_peer: usize,
    pub churn: Option<ChurnParameters>,
    pub subnet: String,
    pub internet: bool,
    pub peer_binary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChurnParameters {
    pub start_secs: u64,
    pub down_secs: u64,
    pub selection: String,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let argv = std::iter::once("gossip-lab").chain(args.iter().copied());
        Cli::try_parse_from(argv).unwrap()
    }

    fn config(args: &[&str]) -> Result<LabConfig> {
        LabConfig::from_cli(&parse(args))
    }

    pub(crate) fn sample_parameters() -> RunParameters {
        config(&[]).unwrap().parameters()
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.run.peer_count, 5);
        assert_eq!(cfg.run.bootstrap, BootstrapPolicy::Single);
        assert_eq!(cfg.run.sender_peer, 1);
        assert!(cfg.run.churn.is_none());
        assert_eq!(cfg.run.network, NetworkScenario::Clean);
        assert_eq!(cfg.run.readiness, ReadinessBudget::default());
        assert_eq!(cfg.clean_peer, Some(1));
        assert!(cfg.egress.is_none());
        assert_eq!(cfg.peer.discovery, DiscoveryMode::Direct);
        assert_eq!(cfg.topology.subnet.to_string(), "10.10.0.0/24");
        assert!(cfg.required_tools().is_empty());
    }

    #[test]
    fn test_churn_selection_flags() {
        let cfg = config(&["--churn"]).unwrap();
        assert_eq!(cfg.run.churn.unwrap().selection, ChurnSelection::Half);

        let cfg = config(&["--churn-count", "3", "--churn-start", "5"]).unwrap();
        let churn = cfg.run.churn.unwrap();
        assert_eq!(churn.selection, ChurnSelection::Count(3));
        assert_eq!(churn.start, Duration::from_secs(5));
        assert_eq!(churn.down, Duration::from_secs(10));

        let cfg = config(&["--churn-peers", "2,4"]).unwrap();
        assert_eq!(cfg.run.churn.unwrap().selection, ChurnSelection::Fixed(vec![2, 4]));

        let argv = ["gossip-lab", "--churn-count", "2", "--churn-pct", "30"];
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_churn_peers_must_not_name_bootstrap_peers() {
        let err = config(&["--peers", "5", "--churn-peers", "1,2"]).unwrap_err();
        assert!(err.to_string().contains("bootstrap"), "{err}");
        assert!(config(&["--peers", "5", "--churn-peers", "1"]).is_err());
        assert!(config(&["--bootstrap-count", "2", "--churn-peers", "2,4"]).is_err());
        assert!(config(&["--bootstrap-count", "2", "--churn-peers", "3,4"]).is_ok());
        // Random per-group sets are only known at run time
        assert!(config(&["--peers", "10", "--bootstrap-per", "5", "--churn-peers", "3"]).is_ok());
    }

    #[test]
    fn test_bootstrap_flags() {
        let cfg = config(&["--peers", "30", "--bootstrap-per", "10"]).unwrap();
        assert_eq!(cfg.run.bootstrap, BootstrapPolicy::PerGroup(10));

        let cfg = config(&["--bootstrap-count", "2"]).unwrap();
        assert_eq!(cfg.run.bootstrap, BootstrapPolicy::Fixed(2));

        assert!(config(&["--bootstrap-count", "0"]).is_err());
        let argv = ["gossip-lab", "--bootstrap-count", "2", "--bootstrap-per", "5"];
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_network_flags() {
        let cfg = config(&["--net", "loss-delay", "--loss-pct", "1", "--delay-ms", "40"]).unwrap();
        assert_eq!(
            cfg.run.network,
            NetworkScenario::LossDelay {
                loss_percent: 1.0,
                delay_ms: 40,
                jitter_ms: 20,
            }
        );
        assert_eq!(cfg.required_tools(), vec!["tc"]);

        let cfg = config(&["--net", "loss", "--no-clean-peer"]).unwrap();
        assert_eq!(cfg.clean_peer, None);

        assert!(config(&["--net", "loss", "--loss-pct", "150"]).is_err());
    }

    #[test]
    fn test_egress_flags() {
        let cfg = config(&["--internet", "--dns", "9.9.9.9"]).unwrap();
        assert_eq!(cfg.egress.as_ref().and_then(|e| e.dns), Some(Ipv4Addr::new(9, 9, 9, 9)));
        assert_eq!(cfg.required_tools(), vec!["iptables", "sysctl"]);

        assert!(Cli::try_parse_from(["gossip-lab", "--dns", "9.9.9.9"]).is_err());
    }

    #[test]
    fn test_validation_rejects_out_of_range_peers() {
        assert!(config(&["--peers", "0"]).is_err());
        assert!(config(&["--peers", "3", "--sender-peer", "4"]).is_err());
        assert!(config(&["--peers", "3", "--clean-peer", "9"]).is_err());
        assert!(config(&["--peers", "3", "--churn-peers", "1,7"]).is_err());
        assert!(config(&["--churn-pct", "0"]).is_err());
        assert!(config(&["--ready-attempts", "0"]).is_err());
        // /24 leaves room for 244 peers
        assert!(config(&["--peers", "244"]).is_ok());
        assert!(config(&["--peers", "245"]).is_err());
    }

    #[test]
    fn test_parameters_snapshot() {
        let params = config(&["--discovery", "relay", "--churn-count", "3"]).unwrap().parameters();
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["discovery"], "relay");
        assert_eq!(value["network"], "clean");
        assert_eq!(value["churn"]["selection"], "3 random");
        assert_eq!(value["bootstrap"], "single (peer 1)");
    }
}
