//! Child processes inside network namespaces, plus dependency checks.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::debug;

use crate::topology::Namespace;

// ---------------------------------------------------------------------------
// Dependency checking
// ---------------------------------------------------------------------------

/// Check if a binary exists in PATH.
pub fn check_binary(name: &str) -> Option<PathBuf> {
    Command::new("sh")
        .args(["-c", &format!("command -v {name}")])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| PathBuf::from(String::from_utf8_lossy(&o.stdout).trim().to_string()))
}

/// Resolve a program given either as a path or as a name on PATH.
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = Path::new(program);
        return path.is_file().then(|| path.to_path_buf());
    }
    check_binary(program)
}

/// Reason why the testbed cannot run on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotRoot,
    MissingBinary(String),
    MissingTool(String),
    NoNetem,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NotRoot => write!(f, "requires root / passwordless sudo"),
            SkipReason::MissingBinary(b) => write!(f, "peer binary '{b}' not found"),
            SkipReason::MissingTool(t) => write!(f, "system tool '{t}' not found"),
            SkipReason::NoNetem => write!(
                f,
                "sch_netem kernel module not available (try: sudo modprobe sch_netem)"
            ),
        }
    }
}

/// Check everything a testbed run needs.
///
/// `tools` lists extra system tools beyond `ip` (e.g. `tc`, `iptables`).
/// Returns the first missing dependency.
pub fn check_lab_deps(peer_binary: &str, tools: &[&str]) -> std::result::Result<(), SkipReason> {
    if !crate::test_util::check_privileges() {
        return Err(SkipReason::NotRoot);
    }

    if resolve_program(peer_binary).is_none() {
        return Err(SkipReason::MissingBinary(peer_binary.to_string()));
    }

    for tool in std::iter::once(&"ip").chain(tools) {
        if check_binary(tool).is_none() {
            return Err(SkipReason::MissingTool(tool.to_string()));
        }
    }

    Ok(())
}

/// Load `sch_netem`; fails when the kernel cannot shape traffic.
pub fn check_netem() -> std::result::Result<(), SkipReason> {
    let modprobe_ok = Command::new("sudo")
        .args(["modprobe", "sch_netem"])
        .output()
        .is_ok_and(|o| o.status.success());

    if !modprobe_ok {
        return Err(SkipReason::NoNetem);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// NamespaceProcess
// ---------------------------------------------------------------------------

/// Where a spawned process's stdout and stderr go.
pub struct ProcessIo {
    pub stdout: Stdio,
    pub stderr: Stdio,
}

/// A child process running inside a network namespace.
///
/// The child leads its own process group so signals reach the inner program
/// through the `sudo ip netns exec` wrapper. Still-running processes are
/// killed on drop.
pub struct NamespaceProcess {
    child: Child,
    label: String,
}

impl NamespaceProcess {
    /// Spawn `binary args...` inside `ns` via `sudo ip netns exec`, with
    /// additional environment variables as `(key, value)` pairs.
    pub fn spawn(
        ns: &Namespace,
        binary: &str,
        args: &[String],
        env: &[(&str, &str)],
        io: ProcessIo,
    ) -> Result<Self> {
        let label = format!("{binary} in ns:{}", ns.name);
        let mut cmd = Command::new("sudo");
        cmd.args(["ip", "netns", "exec", &ns.name]);
        if !env.is_empty() {
            // sudo resets the environment; `env` re-adds ours inside the namespace
            cmd.arg("env");
            for &(k, v) in env {
                cmd.arg(format!("{k}={v}"));
            }
        }
        cmd.arg(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(io.stdout)
            .stderr(io.stderr)
            .process_group(0);

        let child = cmd.spawn().with_context(|| format!("spawn {label}"))?;

        debug!(%label, pid = child.id(), "spawned namespace process");
        Ok(Self { child, label })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Take the piped stderr handle, if stderr was piped.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Send SIGTERM to the process group and return immediately.
    pub fn terminate(&mut self) {
        self.signal_group("-TERM");
    }

    /// Send SIGKILL to the process group and reap the wrapper.
    pub fn force_kill(&mut self) {
        self.signal_group("-9");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    /// Send SIGTERM, wait up to `grace`, then SIGKILL if needed.
    pub fn kill(&mut self, grace: Duration) {
        if !self.is_alive() {
            return;
        }
        self.terminate();
        if self.wait_timeout(grace).is_some() {
            return;
        }
        debug!(label = self.label, "process ignored SIGTERM; killing");
        self.force_kill();
    }

    /// Poll for exit without blocking.
    pub fn try_wait(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Poll until exit or `timeout`.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait() {
                return Some(status);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Check if the process is still running.
    pub fn is_alive(&mut self) -> bool {
        self.try_wait().is_none()
    }

    fn signal_group(&self, signal: &str) {
        // The wrapper runs as root, so the signal has to as well
        let _ = Command::new("sudo")
            .args(["kill", signal, "--", &format!("-{}", self.pid())])
            .output();
    }
}

impl Drop for NamespaceProcess {
    fn drop(&mut self) {
        self.kill(Duration::from_secs(2));
    }
}
