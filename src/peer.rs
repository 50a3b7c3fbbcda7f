//! Peer binary invocation and the process launcher seam.
//!
//! The orchestrator only talks to [`PeerLauncher`] and [`PeerProcess`], so a
//! run can be driven against real namespaces ([`NetnsLauncher`]) or against
//! in-process fakes in tests.

use std::path::Path;
use std::process::Stdio;
use std::sync::mpsc::Receiver;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use network_sim::{Namespace, NamespaceProcess, ProcessIo, TopologyConfig};
use serde::Serialize;
use tracing::debug;

use crate::collector::RunDir;
use crate::mode::{DiscoveryMode, Role};
use crate::readiness::spawn_diagnostic_tee;

/// Everything passed to the peer binary that does not vary per launch.
#[derive(Debug, Clone)]
pub struct PeerInvocation {
    /// Path (or PATH name) of the peer binary.
    pub binary: String,
    pub topic: String,
    pub discovery: DiscoveryMode,
    pub idle_report_ms: u64,
    pub messages: u64,
    pub rate: u32,
    pub payload_size: usize,
    /// `RUST_LOG` for peer processes; must let the `node_id=` line through.
    pub log_level: String,
}

impl PeerInvocation {
    /// Command line for one launch. Message count, rate and size only go to
    /// the sender.
    pub fn args(&self, role: Role, event_log: &Path, bootstrap: &[String]) -> Vec<String> {
        let mut args = vec![
            "--role".to_string(),
            role.to_string(),
            "--log".to_string(),
            event_log.display().to_string(),
            "--idle-report-ms".to_string(),
            self.idle_report_ms.to_string(),
            "--topic-name".to_string(),
            self.topic.clone(),
            "--discovery".to_string(),
            self.discovery.to_string(),
        ];
        if !bootstrap.is_empty() {
            args.push("--bootstrap".to_string());
            args.push(bootstrap.join(","));
        }
        if role == Role::Sender {
            args.extend([
                "--num".to_string(),
                self.messages.to_string(),
                "--rate".to_string(),
                self.rate.to_string(),
                "--size".to_string(),
                self.payload_size.to_string(),
            ]);
        }
        args
    }
}

/// One process launch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub peer: usize,
    pub role: Role,
    /// Resolved node identifiers of the bootstrap peers; empty for the
    /// bootstrap peers themselves.
    pub bootstrap: Vec<String>,
    /// Set when churn brings the peer back.
    pub relaunch: bool,
}

impl LaunchSpec {
    pub fn label(&self) -> String {
        format!("peer{}-{}", self.peer, self.role)
    }
}

/// Exit status as recorded in the manifest. `None` means killed by signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

/// A running peer process.
pub trait PeerProcess {
    fn pid(&self) -> Option<u32>;

    /// Send a termination signal and return without waiting. A no-op on a
    /// process that already exited.
    fn terminate(&mut self);

    /// Kill outright and reap.
    fn kill(&mut self);

    /// Non-blocking exit check.
    fn try_wait(&mut self) -> Option<ProcessExit>;
}

/// A launched process plus the channel its node identifier arrives on.
pub struct Launched<P> {
    pub process: P,
    pub ready: Receiver<String>,
}

/// Starts peer processes.
pub trait PeerLauncher {
    type Process: PeerProcess;

    fn launch(&mut self, spec: &LaunchSpec) -> Result<Launched<Self::Process>>;
}

/// Launches the peer binary inside the peer's network namespace.
///
/// Stdout goes straight to the peer's stdout file; stderr is teed into the
/// diagnostic log by a helper thread that also watches for the node id.
pub struct NetnsLauncher {
    topology: TopologyConfig,
    invocation: PeerInvocation,
    run_dir: RunDir,
}

impl NetnsLauncher {
    pub fn new(topology: TopologyConfig, invocation: PeerInvocation, run_dir: RunDir) -> Self {
        Self {
            topology,
            invocation,
            run_dir,
        }
    }
}

impl PeerLauncher for NetnsLauncher {
    type Process = NetnsPeer;

    fn launch(&mut self, spec: &LaunchSpec) -> Result<Launched<NetnsPeer>> {
        let label = spec.label();
        let files = self.run_dir.peer_files(spec.peer, spec.role);
        let namespace = Namespace::attach(&self.topology.namespace_name(spec.peer));
        let args = self
            .invocation
            .args(spec.role, &files.event_log, &spec.bootstrap);

        let diagnostics = files.open_diagnostics()?;
        let stdout = files.create_stdout()?;
        let env = [("RUST_LOG", self.invocation.log_level.as_str())];

        let mut inner = NamespaceProcess::spawn(
            &namespace,
            &self.invocation.binary,
            &args,
            &env,
            ProcessIo {
                stdout: Stdio::from(stdout),
                stderr: Stdio::piped(),
            },
        )
        .with_context(|| format!("launch {label}"))?;

        let stderr = inner
            .take_stderr()
            .with_context(|| format!("{label}: stderr was not captured"))?;
        let (ready, tee) = spawn_diagnostic_tee(stderr, diagnostics, label.clone());

        debug!(%label, pid = inner.pid(), relaunch = spec.relaunch, "peer process started");
        Ok(Launched {
            process: NetnsPeer {
                inner,
                tee: Some(tee),
            },
            ready,
        })
    }
}

/// A peer binary running in a namespace.
pub struct NetnsPeer {
    inner: NamespaceProcess,
    tee: Option<JoinHandle<()>>,
}

impl NetnsPeer {
    /// Join the tee thread once the pipe has drained.
    fn finish_tee(&mut self) {
        if self.tee.as_ref().is_some_and(JoinHandle::is_finished)
            && let Some(handle) = self.tee.take()
        {
            let _ = handle.join();
        }
    }
}

impl PeerProcess for NetnsPeer {
    fn pid(&self) -> Option<u32> {
        Some(self.inner.pid())
    }

    fn terminate(&mut self) {
        if self.inner.is_alive() {
            self.inner.terminate();
        }
    }

    fn kill(&mut self) {
        self.inner.force_kill();
        self.finish_tee();
    }

    fn try_wait(&mut self) -> Option<ProcessExit> {
        let status = self.inner.try_wait()?;
        self.finish_tee();
        Some(ProcessExit {
            code: status.code(),
        })
    }
}
