//! Drives one run: bootstrap, ordered launches, churn, join, conclude.
//!
//! The orchestrator is a single blocking control flow. Every wait goes
//! through the shared [`CancelToken`], so an interrupt unwinds through the
//! same cleanup path as any other failure.

use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use anyhow::Result;
use network_sim::NetworkScenario;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bootstrap::{BootstrapPolicy, BootstrapSet};
use crate::churn::ChurnSchedule;
use crate::error::LabError;
use crate::mode::Role;
use crate::peer::{LaunchSpec, Launched, PeerLauncher, PeerProcess, ProcessExit};
use crate::readiness::{Readiness, ReadinessBudget, await_node_id};
use crate::testbed::{Testbed, TestbedGuard};
use crate::utils::{CancelToken, elapsed_ms};

/// Run-shape parameters the orchestrator acts on.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub peer_count: usize,
    /// Peer whose namespace hosts the sender.
    pub sender_peer: usize,
    pub bootstrap: BootstrapPolicy,
    pub churn: Option<ChurnSchedule>,
    pub network: NetworkScenario,
    pub readiness: ReadinessBudget,
    /// Poll interval while joining processes.
    pub poll_interval: Duration,
    /// How long churned processes get to exit before being killed.
    pub reap_grace: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            peer_count: 5,
            sender_peer: 1,
            bootstrap: BootstrapPolicy::Single,
            churn: None,
            network: NetworkScenario::Clean,
            readiness: ReadinessBudget::default(),
            poll_interval: Duration::from_millis(100),
            reap_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminationReason {
    Churn,
    Abort,
    /// Churned process that ignored SIGTERM past the reap grace.
    Reap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchRecord {
    pub peer: usize,
    pub role: Role,
    pub relaunch: bool,
    pub at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminationRecord {
    pub peer: usize,
    pub role: Role,
    pub reason: TerminationReason,
    pub at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitRecord {
    pub peer: usize,
    pub role: Role,
    pub code: Option<i32>,
    pub at_ms: u64,
}

/// What happened during a run, in order. Serialized into the manifest.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub seed: u64,
    pub bootstrap: Vec<usize>,
    pub node_ids: BTreeMap<usize, String>,
    pub churned: Vec<usize>,
    pub launches: Vec<LaunchRecord>,
    pub terminations: Vec<TerminationRecord>,
    pub exits: Vec<ExitRecord>,
}

impl RunReport {
    pub fn launch_count(&self, peer: usize, role: Role) -> usize {
        self.launches
            .iter()
            .filter(|l| l.peer == peer && l.role == role)
            .count()
    }
}

/// Live process handles, keyed by peer index.
struct PeerTable<P> {
    receivers: BTreeMap<usize, P>,
    sender: Option<P>,
    /// Signalled processes awaiting reaping.
    retired: Vec<(usize, Role, P)>,
}

impl<P> PeerTable<P> {
    fn new() -> Self {
        Self {
            receivers: BTreeMap::new(),
            sender: None,
            retired: Vec::new(),
        }
    }
}

/// Runs the phases of one experiment against a launcher.
pub struct Orchestrator<L: PeerLauncher> {
    launcher: L,
    settings: RunSettings,
    cancel: CancelToken,
    rng: StdRng,
    report: RunReport,
    started: Instant,
}

impl<L: PeerLauncher> Orchestrator<L> {
    pub fn new(launcher: L, settings: RunSettings, cancel: CancelToken, seed: u64) -> Self {
        Self {
            launcher,
            settings,
            cancel,
            rng: StdRng::seed_from_u64(seed),
            report: RunReport {
                seed,
                ..Default::default()
            },
            started: Instant::now(),
        }
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn into_report(self) -> RunReport {
        self.report
    }

    /// Execute the run on `testbed`. The testbed is torn down exactly once
    /// on every path out of this function.
    pub fn run<T: Testbed>(&mut self, testbed: &mut T) -> Result<()> {
        self.started = Instant::now();

        info!(peers = self.settings.peer_count, "building testbed");
        let mut guard =
            TestbedGuard::build(testbed).map_err(|err| LabError::Setup(format!("{err:#}")))?;
        guard
            .impair(&self.settings.network)
            .map_err(|err| LabError::Setup(format!("{err:#}")))?;

        let mut peers = PeerTable::new();
        let result = self.drive(&mut peers);
        if let Err(err) = &result {
            warn!("run aborted: {err:#}");
            self.abort(&mut peers);
            self.reap(&mut peers);
        }

        guard.release();
        result
    }

    fn drive(&mut self, peers: &mut PeerTable<L::Process>) -> Result<()> {
        let peer_count = self.settings.peer_count;

        let bootstrap = self.settings.bootstrap.select(peer_count, &mut self.rng);
        info!(
            policy = %self.settings.bootstrap,
            peers = ?bootstrap.peers(),
            "bootstrap peers selected"
        );
        self.report.bootstrap = bootstrap.peers().to_vec();
        if let Some(schedule) = &self.settings.churn {
            schedule.selection.check(peer_count, &bootstrap)?;
        }

        let ids = self.start_bootstrap(peers, &bootstrap)?;

        let regular = bootstrap.regular_peers(peer_count);
        info!(count = regular.len(), "launching receivers");
        for peer in regular {
            self.launch(peers, peer, Role::Receiver, ids.clone(), false)?;
        }

        info!(peer = self.settings.sender_peer, "launching sender");
        self.launch(peers, self.settings.sender_peer, Role::Sender, ids.clone(), false)?;

        if let Some(schedule) = self.settings.churn.clone() {
            self.churn(peers, &schedule, &bootstrap, &ids)?;
        }

        self.join(peers)?;
        info!(elapsed_ms = elapsed_ms(self.started), "run complete");
        Ok(())
    }

    /// Launch bootstrap receivers and resolve their node identifiers, in
    /// bootstrap order.
    fn start_bootstrap(
        &mut self,
        peers: &mut PeerTable<L::Process>,
        bootstrap: &BootstrapSet,
    ) -> Result<Vec<String>> {
        let mut pending = Vec::with_capacity(bootstrap.len());
        for &peer in bootstrap.peers() {
            let ready = self.launch(peers, peer, Role::Receiver, Vec::new(), false)?;
            pending.push((peer, ready));
        }

        let budget = self.settings.readiness;
        let mut ids = Vec::with_capacity(pending.len());
        for (peer, ready) in pending {
            match await_node_id(&ready, budget, &self.cancel)? {
                Readiness::Ready(id) => {
                    info!(peer, node_id = %id, "bootstrap peer ready");
                    self.report.node_ids.insert(peer, id.clone());
                    ids.push(id);
                }
                Readiness::TimedOut => {
                    return Err(LabError::BootstrapTimeout {
                        peer,
                        waited: budget.total(),
                    }
                    .into());
                }
                Readiness::Closed => return Err(LabError::BootstrapExited { peer }.into()),
            }
        }
        Ok(ids)
    }

    fn launch(
        &mut self,
        peers: &mut PeerTable<L::Process>,
        peer: usize,
        role: Role,
        bootstrap: Vec<String>,
        relaunch: bool,
    ) -> Result<Receiver<String>> {
        self.cancel.check()?;
        let spec = LaunchSpec {
            peer,
            role,
            bootstrap,
            relaunch,
        };
        let Launched { process, ready } = self.launcher.launch(&spec)?;
        debug!(peer, %role, pid = ?process.pid(), relaunch, "launched");

        self.report.launches.push(LaunchRecord {
            peer,
            role,
            relaunch,
            at_ms: elapsed_ms(self.started),
        });
        match role {
            Role::Receiver => {
                if let Some(previous) = peers.receivers.insert(peer, process) {
                    peers.retired.push((peer, Role::Receiver, previous));
                }
            }
            Role::Sender => peers.sender = Some(process),
        }
        Ok(ready)
    }

    fn churn(
        &mut self,
        peers: &mut PeerTable<L::Process>,
        schedule: &ChurnSchedule,
        bootstrap: &BootstrapSet,
        ids: &[String],
    ) -> Result<()> {
        info!(start = ?schedule.start, down = ?schedule.down, selection = %schedule.selection, "churn scheduled");
        self.cancel.sleep(schedule.start)?;

        let chosen = schedule
            .selection
            .select(self.settings.peer_count, bootstrap, &mut self.rng)?;
        if chosen.is_empty() {
            warn!("churn skipped: no non-bootstrap peers");
            return Ok(());
        }
        self.report.churned = chosen.clone();

        info!(peers = ?chosen, "churn: taking peers offline");
        for &peer in &chosen {
            // Already-exited processes take the signal as a no-op
            if let Some(mut process) = peers.receivers.remove(&peer) {
                process.terminate();
                self.record_termination(peer, Role::Receiver, TerminationReason::Churn);
                peers.retired.push((peer, Role::Receiver, process));
            }
        }

        self.cancel.sleep(schedule.down)?;

        info!(peers = ?chosen, "churn: relaunching peers");
        for &peer in &chosen {
            self.launch(peers, peer, Role::Receiver, ids.to_vec(), true)?;
        }
        Ok(())
    }

    /// Wait for the sender, then every receiver, then reap churned
    /// processes. Exit statuses are recorded, never acted on.
    fn join(&mut self, peers: &mut PeerTable<L::Process>) -> Result<()> {
        // Handles leave the table only once exited, so an abort mid-join
        // signals exactly the processes still running
        if let Some(sender) = peers.sender.as_mut() {
            info!("waiting for sender to finish");
            let exit = wait_for_exit(sender, &self.cancel, self.settings.poll_interval)?;
            peers.sender = None;
            self.record_exit(self.settings.sender_peer, Role::Sender, exit);
        }

        info!(count = peers.receivers.len(), "waiting for receivers to go idle");
        let receivers: Vec<usize> = peers.receivers.keys().copied().collect();
        for peer in receivers {
            if let Some(process) = peers.receivers.get_mut(&peer) {
                let exit = wait_for_exit(process, &self.cancel, self.settings.poll_interval)?;
                peers.receivers.remove(&peer);
                self.record_exit(peer, Role::Receiver, exit);
            }
        }

        self.reap(peers);
        Ok(())
    }

    /// Signal every process still tracked and hand it to [`Self::reap`].
    fn abort(&mut self, peers: &mut PeerTable<L::Process>) {
        for (_, _, process) in peers.retired.iter_mut() {
            process.terminate();
        }
        if let Some(mut sender) = peers.sender.take() {
            sender.terminate();
            self.record_termination(self.settings.sender_peer, Role::Sender, TerminationReason::Abort);
            peers.retired.push((self.settings.sender_peer, Role::Sender, sender));
        }
        for (peer, mut process) in std::mem::take(&mut peers.receivers) {
            process.terminate();
            self.record_termination(peer, Role::Receiver, TerminationReason::Abort);
            peers.retired.push((peer, Role::Receiver, process));
        }
    }

    /// Wait out one shared grace period for signalled processes, then kill
    /// whatever is left. Not cancellable.
    fn reap(&mut self, peers: &mut PeerTable<L::Process>) {
        let mut pending = std::mem::take(&mut peers.retired);
        let deadline = Instant::now() + self.settings.reap_grace;
        let poll = self.settings.poll_interval.min(Duration::from_millis(50));
        loop {
            let mut running = Vec::with_capacity(pending.len());
            for (peer, role, mut process) in pending {
                match process.try_wait() {
                    Some(exit) => self.record_exit(peer, role, exit),
                    None => running.push((peer, role, process)),
                }
            }
            pending = running;
            if pending.is_empty() || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(poll);
        }

        for (peer, role, mut process) in pending {
            warn!(peer, %role, "process ignored SIGTERM; killing");
            process.kill();
            self.record_termination(peer, role, TerminationReason::Reap);
            let exit = process.try_wait().unwrap_or(ProcessExit { code: None });
            self.record_exit(peer, role, exit);
        }
    }

    fn record_termination(&mut self, peer: usize, role: Role, reason: TerminationReason) {
        self.report.terminations.push(TerminationRecord {
            peer,
            role,
            reason,
            at_ms: elapsed_ms(self.started),
        });
    }

    fn record_exit(&mut self, peer: usize, role: Role, exit: ProcessExit) {
        debug!(peer, %role, code = ?exit.code, "process exited");
        self.report.exits.push(ExitRecord {
            peer,
            role,
            code: exit.code,
            at_ms: elapsed_ms(self.started),
        });
    }
}

fn wait_for_exit<P: PeerProcess>(
    process: &mut P,
    cancel: &CancelToken,
    poll: Duration,
) -> Result<ProcessExit, LabError> {
    loop {
        if let Some(exit) = process.try_wait() {
            return Ok(exit);
        }
        cancel.sleep(poll)?;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use anyhow::bail;

    use super::*;

    /// Exits on the first poll; bootstrap peers announce `id{peer}`.
    struct Exited;

    impl PeerProcess for Exited {
        fn pid(&self) -> Option<u32> {
            None
        }
        fn terminate(&mut self) {}
        fn kill(&mut self) {}
        fn try_wait(&mut self) -> Option<ProcessExit> {
            Some(ProcessExit { code: Some(0) })
        }
    }

    #[derive(Default)]
    struct Immediate {
        specs: Vec<LaunchSpec>,
    }

    impl PeerLauncher for Immediate {
        type Process = Exited;

        fn launch(&mut self, spec: &LaunchSpec) -> Result<Launched<Exited>> {
            self.specs.push(spec.clone());
            let (tx, ready) = mpsc::sync_channel(1);
            tx.send(format!("id{}", spec.peer))?;
            Ok(Launched {
                process: Exited,
                ready,
            })
        }
    }

    #[derive(Default)]
    struct Bed {
        teardowns: usize,
        fail_impair: bool,
    }

    impl Testbed for Bed {
        fn build(&mut self) -> Result<()> {
            Ok(())
        }
        fn impair(&mut self, _scenario: &NetworkScenario) -> Result<()> {
            if self.fail_impair {
                bail!("Error: Specified qdisc kind is unknown.");
            }
            Ok(())
        }
        fn clear_impairment(&mut self) {}
        fn teardown(&mut self) {
            self.teardowns += 1;
        }
    }

    fn settings(peer_count: usize, bootstrap: BootstrapPolicy) -> RunSettings {
        RunSettings {
            peer_count,
            bootstrap,
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[test]
    fn every_dependent_launch_gets_all_bootstrap_ids() {
        let mut orch = Orchestrator::new(
            Immediate::default(),
            settings(6, BootstrapPolicy::Fixed(2)),
            CancelToken::new(),
            1,
        );
        let mut bed = Bed::default();
        orch.run(&mut bed).unwrap();

        let specs = &orch.launcher().specs;
        assert_eq!(specs.len(), 7);
        assert!(specs[..2].iter().all(|s| s.bootstrap.is_empty()));
        assert!(
            specs[2..]
                .iter()
                .all(|s| s.bootstrap == ["id1".to_string(), "id2".to_string()])
        );
        assert_eq!(specs.last().map(|s| s.role), Some(Role::Sender));
        assert_eq!(orch.report().exits.len(), 7);
        assert_eq!(bed.teardowns, 1);
    }

    #[test]
    fn impairment_failure_is_setup_error() {
        let mut orch = Orchestrator::new(
            Immediate::default(),
            settings(3, BootstrapPolicy::Single),
            CancelToken::new(),
            1,
        );
        let mut bed = Bed {
            fail_impair: true,
            ..Default::default()
        };
        let err = orch.run(&mut bed).unwrap_err();
        assert!(matches!(err.downcast_ref::<LabError>(), Some(LabError::Setup(_))));
        assert!(orch.launcher().specs.is_empty());
        assert_eq!(bed.teardowns, 1);
    }

    #[test]
    fn cancelled_run_is_interrupted_and_torn_down() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut orch =
            Orchestrator::new(Immediate::default(), settings(3, BootstrapPolicy::Single), cancel, 1);
        let mut bed = Bed::default();
        let err = orch.run(&mut bed).unwrap_err();
        assert!(matches!(err.downcast_ref::<LabError>(), Some(LabError::Interrupted)));
        assert_eq!(bed.teardowns, 1);
    }
}
