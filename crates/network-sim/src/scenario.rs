use std::fmt;

use anyhow::{Context, Result};
use tracing::info;

use crate::impairment::{ImpairmentProfile, apply_impairment, clear_impairment};
use crate::topology::{BridgeTopology, Host, NetContext, PEER_IFACE};

/// Which link a profile is installed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkTarget {
    /// The shared bridge device in the host namespace.
    Bridge,
    /// Peer `i`'s interface inside its namespace.
    Peer(usize),
}

impl fmt::Display for LinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkTarget::Bridge => write!(f, "bridge"),
            LinkTarget::Peer(i) => write!(f, "peer{i}"),
        }
    }
}

/// Network condition applied for a whole run.
///
/// `Delay` shapes the bridge uniformly. `Loss` and `LossDelay` shape every
/// peer link except the clean peer, so each run keeps one unimpaired
/// vantage point.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum NetworkScenario {
    #[default]
    Clean,
    Delay {
        delay_ms: u32,
    },
    Loss {
        loss_percent: f32,
    },
    LossDelay {
        loss_percent: f32,
        delay_ms: u32,
        jitter_ms: u32,
    },
}

/// One `(link, profile)` assignment of an [`NetworkScenario`].
pub type LinkImpairment = (LinkTarget, ImpairmentProfile);

impl NetworkScenario {
    pub fn name(&self) -> &'static str {
        match self {
            NetworkScenario::Clean => "clean",
            NetworkScenario::Delay { .. } => "delay",
            NetworkScenario::Loss { .. } => "loss",
            NetworkScenario::LossDelay { .. } => "loss-delay",
        }
    }

    pub fn profile(&self) -> ImpairmentProfile {
        match *self {
            NetworkScenario::Clean => ImpairmentProfile::None,
            NetworkScenario::Delay { delay_ms } => ImpairmentProfile::Delay { delay_ms },
            NetworkScenario::Loss { loss_percent } => ImpairmentProfile::Loss { loss_percent },
            NetworkScenario::LossDelay {
                loss_percent,
                delay_ms,
                jitter_ms,
            } => ImpairmentProfile::LossDelayJitter {
                loss_percent,
                delay_ms,
                jitter_ms,
            },
        }
    }

    /// Expand into per-link assignments for `peer_count` peers.
    pub fn plan(&self, peer_count: usize, clean_peer: Option<usize>) -> Vec<LinkImpairment> {
        let profile = self.profile();
        match self {
            NetworkScenario::Clean => Vec::new(),
            NetworkScenario::Delay { .. } => vec![(LinkTarget::Bridge, profile)],
            NetworkScenario::Loss { .. } | NetworkScenario::LossDelay { .. } => (1..=peer_count)
                .filter(|&i| Some(i) != clean_peer)
                .map(|i| (LinkTarget::Peer(i), profile))
                .collect(),
        }
    }
}

impl fmt::Display for NetworkScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkScenario::Clean => write!(f, "clean"),
            _ => write!(f, "{} ({})", self.name(), self.profile()),
        }
    }
}

/// Install every assignment of `plan` on `topo`.
pub fn apply_plan(topo: &BridgeTopology, plan: &[LinkImpairment]) -> Result<()> {
    for (target, profile) in plan {
        let (ctx, iface) = resolve(topo, *target)?;
        apply_impairment(ctx.as_ref(), &iface, &profile.config())
            .with_context(|| format!("impair {target} with {profile}"))?;
    }
    if !plan.is_empty() {
        info!(links = plan.len(), "impairment plan applied");
    }
    Ok(())
}

/// Remove shaping from every link named in `plan`; best-effort.
pub fn clear_plan(topo: &BridgeTopology, plan: &[LinkImpairment]) {
    for (target, _) in plan {
        if let Ok((ctx, iface)) = resolve(topo, *target) {
            clear_impairment(ctx.as_ref(), &iface);
        }
    }
}

fn resolve(topo: &BridgeTopology, target: LinkTarget) -> Result<(Box<dyn NetContext>, String)> {
    match target {
        LinkTarget::Bridge => Ok((Box::new(Host), topo.bridge_name().to_string())),
        LinkTarget::Peer(i) => {
            let peer = topo
                .peer(i)
                .with_context(|| format!("peer {i} not in topology"))?;
            Ok((Box::new(peer.namespace.clone()), PEER_IFACE.to_string()))
        }
    }
}
