//! Run directories and per-peer output files.
//!
//! The collector only guarantees non-colliding, discoverable locations; it
//! never reads or aggregates what peers write there.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, SecondsFormat, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::RunParameters;
use crate::mode::Role;
use crate::orchestrator::RunReport;

pub const MANIFEST_FILE: &str = "run.json";

/// `run-<timestamp>-<parameter tag>` for a run starting at `started`.
pub fn run_id(params: &RunParameters, started: DateTime<Local>) -> String {
    let mut id = format!(
        "run-{}-n{}-m{}-r{}-s{}-{}-{}",
        started.format("%Y%m%d-%H%M%S"),
        params.peers,
        params.messages,
        params.rate,
        params.payload_size,
        params.discovery,
        params.network,
    );
    if params.churn.is_some() {
        id.push_str("-churn");
    }
    id
}

/// Output files of one peer process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFiles {
    /// Structured event log, written by the peer itself (`--log`).
    pub event_log: PathBuf,
    /// Diagnostic stream, appended across relaunches.
    pub diagnostics: PathBuf,
    /// Standard output; a receiver's summary, overwritten on relaunch.
    pub stdout: PathBuf,
}

impl PeerFiles {
    pub fn new(dir: &Path, peer: usize, role: Role) -> Self {
        let stem = format!("peer{peer}-{role}");
        let stdout = match role {
            Role::Receiver => dir.join(format!("peer{peer}-summary.json")),
            Role::Sender => dir.join(format!("{stem}.stdout.log")),
        };
        Self {
            event_log: dir.join(format!("{stem}.log.jsonl")),
            diagnostics: dir.join(format!("{stem}.stderr.log")),
            stdout,
        }
    }

    /// Open the diagnostic log for appending.
    pub fn open_diagnostics(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.diagnostics)
            .with_context(|| format!("open {}", self.diagnostics.display()))
    }

    /// Create (truncate) the stdout file.
    pub fn create_stdout(&self) -> Result<File> {
        File::create(&self.stdout).with_context(|| format!("create {}", self.stdout.display()))
    }
}

/// A run's result directory.
#[derive(Debug, Clone)]
pub struct RunDir {
    id: String,
    path: PathBuf,
}

impl RunDir {
    /// Create `base/<id>`, suffixing `-2`, `-3`, ... if the name is taken.
    pub fn create(base: &Path, id: &str) -> Result<Self> {
        fs::create_dir_all(base).with_context(|| format!("create log dir {}", base.display()))?;
        let mut attempt = 1;
        loop {
            let name = if attempt == 1 {
                id.to_string()
            } else {
                format!("{id}-{attempt}")
            };
            let path = base.join(&name);
            match fs::create_dir(&path) {
                Ok(()) => {
                    info!(dir = %path.display(), "run directory created");
                    return Ok(Self { id: name, path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
                Err(err) => {
                    return Err(err).with_context(|| format!("create {}", path.display()));
                }
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn peer_files(&self, peer: usize, role: Role) -> PeerFiles {
        PeerFiles::new(&self.path, peer, role)
    }

    pub fn write_manifest(&self, manifest: &Manifest<'_>) -> Result<PathBuf> {
        let path = self.path.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(manifest).context("serialize manifest")?;
        fs::write(&path, json + "\n").with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}

/// Contents of `run.json`.
#[derive(Debug, Serialize)]
pub struct Manifest<'a> {
    pub run_id: &'a str,
    pub started_at: String,
    pub finished_at: String,
    pub outcome: String,
    pub parameters: &'a RunParameters,
    pub report: &'a RunReport,
}

impl<'a> Manifest<'a> {
    pub fn new(
        run_id: &'a str,
        started: DateTime<Utc>,
        parameters: &'a RunParameters,
        report: &'a RunReport,
        result: &Result<()>,
    ) -> Self {
        let outcome = match result {
            Ok(()) => "completed".to_string(),
            Err(err) => format!("failed: {err:#}"),
        };
        Self {
            run_id,
            started_at: started.to_rfc3339_opts(SecondsFormat::Secs, true),
            finished_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            outcome,
            parameters,
            report,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::config::tests::sample_parameters;

    #[test]
    fn peer_files_are_keyed_by_index_and_role() {
        let dir = Path::new("/tmp/run-x");
        let rx = PeerFiles::new(dir, 3, Role::Receiver);
        assert_eq!(rx.event_log, dir.join("peer3-receiver.log.jsonl"));
        assert_eq!(rx.diagnostics, dir.join("peer3-receiver.stderr.log"));
        assert_eq!(rx.stdout, dir.join("peer3-summary.json"));

        let tx = PeerFiles::new(dir, 3, Role::Sender);
        assert_eq!(tx.event_log, dir.join("peer3-sender.log.jsonl"));
        assert_ne!(tx.diagnostics, rx.diagnostics);
        assert_ne!(tx.stdout, rx.stdout);
    }

    #[test]
    fn run_id_carries_parameters() {
        let mut params = sample_parameters();
        let started = Local.with_ymd_and_hms(2026, 10, 18, 9, 5, 7).unwrap();
        assert_eq!(
            run_id(&params, started),
            "run-20261018-090507-n5-m2000-r50-s256-direct-clean"
        );
        params.churn = Some(crate::config::ChurnParameters {
            start_secs: 5,
            down_secs: 10,
            selection: "3 random".into(),
        });
        assert!(run_id(&params, started).ends_with("-churn"));
    }

    #[test]
    fn run_dir_never_collides() {
        let base = tempfile::tempdir().unwrap();
        let a = RunDir::create(base.path(), "run-same").unwrap();
        let b = RunDir::create(base.path(), "run-same").unwrap();
        assert_eq!(a.id(), "run-same");
        assert_eq!(b.id(), "run-same-2");
        assert!(a.path().is_dir() && b.path().is_dir());
    }

    #[test]
    fn diagnostics_append_and_stdout_truncates() {
        let base = tempfile::tempdir().unwrap();
        let files = PeerFiles::new(base.path(), 2, Role::Receiver);

        for round in ["first\n", "second\n"] {
            use std::io::Write;
            files.open_diagnostics().unwrap().write_all(round.as_bytes()).unwrap();
            files.create_stdout().unwrap().write_all(round.as_bytes()).unwrap();
        }

        assert_eq!(fs::read_to_string(&files.diagnostics).unwrap(), "first\nsecond\n");
        assert_eq!(fs::read_to_string(&files.stdout).unwrap(), "second\n");
    }

    #[test]
    fn manifest_records_outcome() {
        let base = tempfile::tempdir().unwrap();
        let dir = RunDir::create(base.path(), "run-m").unwrap();
        let params = sample_parameters();
        let report = RunReport::default();
        let failed: Result<()> = Err(anyhow::anyhow!("boom"));

        let manifest = Manifest::new(dir.id(), Utc::now(), &params, &report, &failed);
        let path = dir.write_manifest(&manifest).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["outcome"], "failed: boom");
        assert_eq!(value["parameters"]["peers"], 5);
        assert_eq!(value["run_id"], "run-m");
    }
}
