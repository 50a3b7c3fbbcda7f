//! The network substrate a run executes on, and the guard that tears it down.

use std::ops::{Deref, DerefMut};

use anyhow::Result;
use network_sim::{
    BridgeTopology, EgressConfig, LinkImpairment, NetworkScenario, apply_plan, clear_plan,
};
use tracing::{info, warn};

/// Build, impair and tear down a peer substrate.
pub trait Testbed {
    /// Create the substrate. Errors are setup failures.
    fn build(&mut self) -> Result<()>;

    /// Install the scenario's impairments.
    fn impair(&mut self, scenario: &NetworkScenario) -> Result<()>;

    /// Remove installed impairments; best-effort.
    fn clear_impairment(&mut self);

    /// Remove the substrate; best-effort and safe on a missing substrate.
    fn teardown(&mut self);
}

/// Bridge + namespaces on the local host.
pub struct NetnsTestbed {
    topology: BridgeTopology,
    egress: Option<EgressConfig>,
    clean_peer: Option<usize>,
    applied: Vec<LinkImpairment>,
}

impl NetnsTestbed {
    pub fn new(
        topology: BridgeTopology,
        egress: Option<EgressConfig>,
        clean_peer: Option<usize>,
    ) -> Self {
        Self {
            topology,
            egress,
            clean_peer,
            applied: Vec::new(),
        }
    }

    pub fn topology(&self) -> &BridgeTopology {
        &self.topology
    }
}

impl Testbed for NetnsTestbed {
    fn build(&mut self) -> Result<()> {
        self.topology.build()?;
        if let Some(egress) = &self.egress {
            self.topology.enable_egress(egress)?;
        }
        Ok(())
    }

    fn impair(&mut self, scenario: &NetworkScenario) -> Result<()> {
        self.clear_impairment();
        let plan = scenario.plan(self.topology.config().peer_count, self.clean_peer);
        // Record first so a partial apply is still cleared
        self.applied = plan;
        apply_plan(&self.topology, &self.applied)?;
        if !self.applied.is_empty() {
            info!(scenario = %scenario, "network impairment active");
        }
        Ok(())
    }

    fn clear_impairment(&mut self) {
        if self.applied.is_empty() {
            return;
        }
        clear_plan(&self.topology, &self.applied);
        self.applied.clear();
    }

    fn teardown(&mut self) {
        self.topology.teardown();
    }
}

/// Owns a built testbed for the duration of a run.
///
/// [`TestbedGuard::release`] clears impairment and tears the testbed down;
/// dropping an unreleased guard does the same, so every exit path releases
/// exactly once.
pub struct TestbedGuard<'a, T: Testbed> {
    testbed: &'a mut T,
    released: bool,
}

impl<'a, T: Testbed> TestbedGuard<'a, T> {
    /// Build `testbed`. On failure the partial substrate is torn down before
    /// the error is returned.
    pub fn build(testbed: &'a mut T) -> Result<Self> {
        let mut guard = Self {
            testbed,
            released: false,
        };
        guard.testbed.build()?;
        Ok(guard)
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.testbed.clear_impairment();
        self.testbed.teardown();
        info!("testbed torn down");
    }
}

impl<T: Testbed> Deref for TestbedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.testbed
    }
}

impl<T: Testbed> DerefMut for TestbedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.testbed
    }
}

impl<T: Testbed> Drop for TestbedGuard<'_, T> {
    fn drop(&mut self) {
        if !self.released {
            if std::thread::panicking() {
                warn!("releasing testbed during panic");
            }
            self.release_once();
        }
    }
}
