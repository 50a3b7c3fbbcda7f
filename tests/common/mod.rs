//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use gossip_lab::{
    LaunchSpec, Launched, PeerLauncher, PeerProcess, ProcessExit, Role, RunDir, Testbed,
};
use network_sim::{NetworkScenario, Subnet, check_lab_deps, check_netem};

/// Returns `true` (and says why) when namespace tests cannot run here.
pub fn skip_without_privileges() -> bool {
    match check_lab_deps("sh", &[]) {
        Ok(()) => false,
        Err(reason) => {
            eprintln!("Skipping: {reason}");
            true
        }
    }
}

/// Like `skip_without_privileges` but also requires `tc` and netem.
pub fn skip_without_netem() -> bool {
    match check_lab_deps("sh", &["tc"]).and_then(|()| check_netem()) {
        Ok(()) => false,
        Err(reason) => {
            eprintln!("Skipping: {reason}");
            true
        }
    }
}

static SUBNET_SEQ: AtomicU8 = AtomicU8::new(0);

/// A /24 no other test in this process uses.
pub fn unique_subnet() -> Subnet {
    let seq = SUBNET_SEQ.fetch_add(1, Ordering::Relaxed);
    let third = (std::process::id() % 200) as u8;
    format!("10.{}.{third}.0/24", 200u8.wrapping_add(seq % 50))
        .parse()
        .expect("valid subnet")
}

/// Shell stand-in for the peer binary, speaking the same flag contract.
pub fn fake_peer_script() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/fake-peer.sh")
}

// ---------------------------------------------------------------------------
// In-process fakes for orchestrator tests
// ---------------------------------------------------------------------------

/// Everything the fake launcher and its processes observed.
#[derive(Debug, Default)]
pub struct Journal {
    pub launches: Vec<(LaunchSpec, Instant)>,
    pub terminated: Vec<(usize, Role, Instant)>,
    pub killed: Vec<(usize, Role)>,
}

impl Journal {
    pub fn receiver_launches(&self, peer: usize) -> usize {
        self.launches
            .iter()
            .filter(|(s, _)| s.peer == peer && s.role == Role::Receiver)
            .count()
    }

    pub fn senders(&self) -> Vec<&LaunchSpec> {
        self.launches
            .iter()
            .map(|(s, _)| s)
            .filter(|s| s.role == Role::Sender)
            .collect()
    }

    pub fn terminated_peers(&self, role: Role) -> BTreeSet<usize> {
        self.terminated
            .iter()
            .filter(|(_, r, _)| *r == role)
            .map(|(p, _, _)| *p)
            .collect()
    }
}

pub type SharedJournal = Arc<Mutex<Journal>>;

/// How fake bootstrap peers behave before announcing an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announce {
    /// `fakeid{peer}` is available immediately.
    Immediately,
    /// Never prints an id but keeps running.
    Never,
    /// Exits before printing an id.
    ExitEarly,
}

/// Launcher that fabricates processes with fixed lifetimes.
pub struct FakeLauncher {
    pub journal: SharedJournal,
    pub receiver_lifetime: Duration,
    pub sender_lifetime: Duration,
    pub silent: BTreeSet<usize>,
    pub exit_early: BTreeSet<usize>,
    /// Receivers that only die to `kill`.
    pub ignore_term: BTreeSet<usize>,
    /// When set, launches create the files a real peer would write.
    pub run_dir: Option<RunDir>,
}

impl FakeLauncher {
    pub fn new(journal: SharedJournal) -> Self {
        Self {
            journal,
            receiver_lifetime: Duration::from_millis(150),
            sender_lifetime: Duration::from_millis(50),
            silent: BTreeSet::new(),
            exit_early: BTreeSet::new(),
            ignore_term: BTreeSet::new(),
            run_dir: None,
        }
    }

    fn announce(&self, peer: usize) -> Announce {
        if self.silent.contains(&peer) {
            Announce::Never
        } else if self.exit_early.contains(&peer) {
            Announce::ExitEarly
        } else {
            Announce::Immediately
        }
    }

    fn write_outputs(&self, spec: &LaunchSpec) -> Result<()> {
        use std::io::Write;

        let Some(dir) = &self.run_dir else {
            return Ok(());
        };
        let files = dir.peer_files(spec.peer, spec.role);
        writeln!(files.open_diagnostics()?, "INFO node_id=fakeid{}", spec.peer)?;
        std::fs::write(&files.event_log, "{\"event\":\"start\"}\n")?;
        let summary = match spec.role {
            Role::Receiver => "{\"received\":0}\n",
            Role::Sender => "sent\n",
        };
        files.create_stdout()?.write_all(summary.as_bytes())?;
        Ok(())
    }
}

impl PeerLauncher for FakeLauncher {
    type Process = FakeProcess;

    fn launch(&mut self, spec: &LaunchSpec) -> Result<Launched<FakeProcess>> {
        self.write_outputs(spec)?;
        let announce = self.announce(spec.peer);
        let lifetime = match (spec.role, announce) {
            (_, Announce::ExitEarly) => Duration::ZERO,
            (Role::Receiver, _) => self.receiver_lifetime,
            (Role::Sender, _) => self.sender_lifetime,
        };

        let (tx, ready) = mpsc::sync_channel(1);
        let held = match announce {
            Announce::Immediately => {
                tx.send(format!("fakeid{}", spec.peer))?;
                None
            }
            Announce::Never => Some(tx),
            Announce::ExitEarly => None,
        };

        self.journal
            .lock()
            .unwrap()
            .launches
            .push((spec.clone(), Instant::now()));

        Ok(Launched {
            process: FakeProcess {
                peer: spec.peer,
                role: spec.role,
                started: Instant::now(),
                lifetime,
                terminated: false,
                ignores_term: spec.role == Role::Receiver && self.ignore_term.contains(&spec.peer),
                journal: Arc::clone(&self.journal),
                stream: held,
            },
            ready,
        })
    }
}

pub struct FakeProcess {
    peer: usize,
    role: Role,
    started: Instant,
    lifetime: Duration,
    terminated: bool,
    ignores_term: bool,
    journal: SharedJournal,
    /// Keeps the readiness channel open for peers that never announce.
    stream: Option<SyncSender<String>>,
}

impl PeerProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn terminate(&mut self) {
        let now = Instant::now();
        self.journal
            .lock()
            .unwrap()
            .terminated
            .push((self.peer, self.role, now));
        self.terminated = !self.ignores_term;
        self.stream = None;
    }

    fn kill(&mut self) {
        self.journal.lock().unwrap().killed.push((self.peer, self.role));
        self.terminated = true;
    }

    fn try_wait(&mut self) -> Option<ProcessExit> {
        if self.terminated {
            return Some(ProcessExit { code: None });
        }
        (self.started.elapsed() >= self.lifetime).then_some(ProcessExit { code: Some(0) })
    }
}

/// Testbed that only counts calls.
#[derive(Debug, Default)]
pub struct FakeTestbed {
    pub builds: usize,
    pub impairs: Vec<NetworkScenario>,
    pub clears: usize,
    pub teardowns: usize,
    pub fail_build: bool,
}

impl Testbed for FakeTestbed {
    fn build(&mut self) -> Result<()> {
        self.builds += 1;
        if self.fail_build {
            bail!("ip link add name br-glab type bridge: Operation not permitted");
        }
        Ok(())
    }

    fn impair(&mut self, scenario: &NetworkScenario) -> Result<()> {
        self.impairs.push(*scenario);
        Ok(())
    }

    fn clear_impairment(&mut self) {
        self.clears += 1;
    }

    fn teardown(&mut self) {
        self.teardowns += 1;
    }
}
