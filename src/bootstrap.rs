//! Bootstrap peer selection.
//!
//! Bootstrap peers are the discovery anchors: they start first, with an empty
//! bootstrap list, and every other peer is handed their node identifiers.

use std::fmt;

use rand::Rng;
use rand::seq::SliceRandom;
use serde::Serialize;

/// How many bootstrap peers a run gets, and which.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootstrapPolicy {
    /// Peer 1 only.
    #[default]
    Single,
    /// The `n` lowest-indexed peers.
    Fixed(usize),
    /// One per `k` peers (`ceil(P/k)`): peer 1 plus a uniform random
    /// choice among the rest.
    PerGroup(usize),
}

impl fmt::Display for BootstrapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapPolicy::Single => write!(f, "single (peer 1)"),
            BootstrapPolicy::Fixed(n) => write!(f, "fixed {n} lowest"),
            BootstrapPolicy::PerGroup(k) => write!(f, "one per {k} peers"),
        }
    }
}

/// `ceil(peers / group)`, never below one.
pub fn per_group_count(peers: usize, group: usize) -> usize {
    peers.div_ceil(group.max(1)).max(1)
}

/// The chosen bootstrap peers, sorted ascending with peer 1 first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct BootstrapSet(Vec<usize>);

impl BootstrapSet {
    pub fn peers(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, peer: usize) -> bool {
        self.0.binary_search(&peer).is_ok()
    }

    /// Peers in `1..=peer_count` that are not bootstrap peers.
    pub fn regular_peers(&self, peer_count: usize) -> Vec<usize> {
        (1..=peer_count).filter(|&p| !self.contains(p)).collect()
    }
}

impl BootstrapPolicy {
    /// Number of bootstrap peers this policy yields for `peer_count` peers.
    pub fn count(&self, peer_count: usize) -> usize {
        let wanted = match *self {
            BootstrapPolicy::Single => 1,
            BootstrapPolicy::Fixed(n) => n,
            BootstrapPolicy::PerGroup(k) => per_group_count(peer_count, k),
        };
        wanted.clamp(1, peer_count.max(1))
    }

    /// The bootstrap set when it does not depend on the seed.
    pub fn fixed_set(&self, peer_count: usize) -> Option<BootstrapSet> {
        match self {
            BootstrapPolicy::Single | BootstrapPolicy::Fixed(_) => {
                Some(BootstrapSet((1..=self.count(peer_count)).collect()))
            }
            BootstrapPolicy::PerGroup(_) => None,
        }
    }

    /// Pick the bootstrap set for `peer_count` peers.
    pub fn select<R: Rng + ?Sized>(&self, peer_count: usize, rng: &mut R) -> BootstrapSet {
        let count = self.count(peer_count);
        let mut peers = match self {
            BootstrapPolicy::Single | BootstrapPolicy::Fixed(_) => (1..=count).collect(),
            BootstrapPolicy::PerGroup(_) => {
                let mut rest: Vec<usize> = (2..=peer_count).collect();
                rest.shuffle(rng);
                rest.truncate(count - 1);
                let mut peers = vec![1];
                peers.extend(rest);
                peers
            }
        };
        peers.sort_unstable();
        BootstrapSet(peers)
    }
}
