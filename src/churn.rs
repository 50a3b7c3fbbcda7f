//! Churn schedule and peer selection.

use std::fmt;
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use rand::Rng;
use rand::seq::index;

use crate::bootstrap::BootstrapSet;

/// Which non-bootstrap peers go offline.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChurnSelection {
    /// Exactly these peers; each must be a non-bootstrap peer.
    Fixed(Vec<usize>),
    /// `n` random peers.
    Count(usize),
    /// `ceil(available * pct / 100)` random peers.
    Percent(u32),
    /// Half of the available peers, rounded up.
    #[default]
    Half,
}

impl fmt::Display for ChurnSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChurnSelection::Fixed(peers) => write!(f, "peers {peers:?}"),
            ChurnSelection::Count(n) => write!(f, "{n} random"),
            ChurnSelection::Percent(p) => write!(f, "{p}% random"),
            ChurnSelection::Half => write!(f, "half random"),
        }
    }
}

/// When churn starts (after sender launch), how long peers stay down, and who.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChurnSchedule {
    pub start: Duration,
    pub down: Duration,
    pub selection: ChurnSelection,
}

impl ChurnSelection {
    /// Requested count for `available` candidates, before clamping.
    pub fn requested(&self, available: usize) -> usize {
        match self {
            ChurnSelection::Fixed(peers) => peers.len(),
            ChurnSelection::Count(n) => *n,
            ChurnSelection::Percent(pct) => (available * *pct as usize).div_ceil(100),
            ChurnSelection::Half => available.div_ceil(2),
        }
    }

    /// Fail if a fixed list names a bootstrap or out-of-range peer.
    /// Random policies always pass.
    pub fn check(&self, peer_count: usize, bootstrap: &BootstrapSet) -> Result<()> {
        let ChurnSelection::Fixed(peers) = self else {
            return Ok(());
        };
        ensure!(!peers.is_empty(), "churn peer list is empty");
        if let Some(&peer) = peers.iter().find(|&&p| p == 0 || p > peer_count) {
            bail!("churn peer {peer} is outside 1..={peer_count}");
        }
        let named: Vec<usize> = peers
            .iter()
            .copied()
            .filter(|&p| bootstrap.contains(p))
            .collect();
        ensure!(
            named.is_empty(),
            "churn peers {named:?} are bootstrap peers {:?}; bootstrap peers never churn",
            bootstrap.peers()
        );
        Ok(())
    }

    /// Pick the churn set: a sorted subset of non-bootstrap peers.
    ///
    /// Random policies draw `clamp(requested, 1, available)` peers uniformly.
    /// A fixed list is taken as is once [`ChurnSelection::check`] passes.
    /// Empty when every peer is a bootstrap peer.
    pub fn select<R: Rng + ?Sized>(
        &self,
        peer_count: usize,
        bootstrap: &BootstrapSet,
        rng: &mut R,
    ) -> Result<Vec<usize>> {
        self.check(peer_count, bootstrap)?;
        let candidates = bootstrap.regular_peers(peer_count);

        let mut chosen: Vec<usize> = match self {
            ChurnSelection::Fixed(peers) => peers.clone(),
            _ if candidates.is_empty() => return Ok(Vec::new()),
            _ => {
                let n = self.requested(candidates.len()).clamp(1, candidates.len());
                index::sample(rng, candidates.len(), n)
                    .into_iter()
                    .map(|i| candidates[i])
                    .collect()
            }
        };
        chosen.sort_unstable();
        chosen.dedup();
        Ok(chosen)
    }
}
