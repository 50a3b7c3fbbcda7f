//! Peer readiness: the first `node_id=<token>` a peer prints.
//!
//! Each peer's diagnostic stream is teed to its log file by a helper thread,
//! which resolves a one-shot channel with the identifier the first time one
//! shows up. Waiters get the same bounded-retry semantics as log polling
//! without racing the file system.

use std::borrow::Cow;
use std::io::{BufRead, BufReader, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::LabError;
use crate::utils::CancelToken;

pub const NODE_ID_KEY: &str = "node_id=";

/// How long to wait for a bootstrap peer: `attempts` polls of `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessBudget {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessBudget {
    fn default() -> Self {
        Self {
            attempts: 80,
            interval: Duration::from_millis(250),
        }
    }
}

impl ReadinessBudget {
    pub fn total(&self) -> Duration {
        self.interval * self.attempts
    }
}

/// Outcome of waiting on one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready(String),
    TimedOut,
    /// The stream closed without an identifier.
    Closed,
}

/// Remove ANSI escape sequences (colored tracing output).
pub fn strip_ansi(line: &str) -> Cow<'_, str> {
    if !line.contains('\x1b') {
        return Cow::Borrowed(line);
    }
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'[') {
            chars.next();
            // CSI: parameters until a final byte in '@'..='~'
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
        }
    }
    Cow::Owned(out)
}

/// Extract the alphanumeric token after `node_id=`, if any.
pub fn parse_node_id(line: &str) -> Option<String> {
    let clean = strip_ansi(line);
    clean.match_indices(NODE_ID_KEY).find_map(|(at, key)| {
        let token: String = clean[at + key.len()..]
            .chars()
            .take_while(char::is_ascii_alphanumeric)
            .collect();
        (!token.is_empty()).then_some(token)
    })
}

/// Copy `source` line by line into `sink`, resolving the returned channel
/// with the first node identifier seen.
pub fn spawn_diagnostic_tee<R, W>(
    source: R,
    mut sink: W,
    label: String,
) -> (Receiver<String>, JoinHandle<()>)
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    let handle = std::thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        let mut notify = Some(tx);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!(%label, "diagnostic stream read error: {err}");
                    break;
                }
            }
            if let Err(err) = sink.write_all(&buf).and_then(|()| sink.flush()) {
                warn!(%label, "failed to write diagnostic log: {err}");
            }
            if notify.is_some()
                && let Some(id) = parse_node_id(&String::from_utf8_lossy(&buf))
                && let Some(tx) = notify.take()
            {
                debug!(%label, node_id = %id, "node id observed");
                let _ = tx.send(id);
            }
        }
    });
    (rx, handle)
}

/// Wait for a node identifier on `rx` within `budget`.
pub fn await_node_id(
    rx: &Receiver<String>,
    budget: ReadinessBudget,
    cancel: &CancelToken,
) -> Result<Readiness, LabError> {
    for _ in 0..budget.attempts {
        cancel.check()?;
        match rx.recv_timeout(budget.interval) {
            Ok(id) => return Ok(Readiness::Ready(id)),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Ok(Readiness::Closed),
        }
    }
    Ok(Readiness::TimedOut)
}
