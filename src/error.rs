//! Failures that end a run with a specific exit code.
//!
//! Everything else travels as `anyhow::Error` and maps to exit code 1.

use std::time::Duration;

/// Run-fatal conditions the CLI distinguishes by exit code.
#[derive(Debug, thiserror::Error)]
pub enum LabError {
    /// A privileged network operation or a preflight check failed.
    #[error("testbed setup failed: {0}")]
    Setup(String),

    /// A bootstrap peer never printed its node identifier.
    #[error("bootstrap peer {peer} reported no node_id within {waited:?}")]
    BootstrapTimeout { peer: usize, waited: Duration },

    /// A bootstrap peer exited before printing its node identifier.
    #[error("bootstrap peer {peer} exited before reporting a node_id")]
    BootstrapExited { peer: usize },

    /// Ctrl-C or another cancellation request.
    #[error("run interrupted")]
    Interrupted,
}

impl LabError {
    pub fn exit_code(&self) -> u8 {
        match self {
            LabError::Setup(_) => 1,
            LabError::BootstrapTimeout { .. } | LabError::BootstrapExited { .. } => 2,
            LabError::Interrupted => 130,
        }
    }
}

/// Exit code for any error, looking through `anyhow` context layers.
pub fn exit_code_of(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<LabError>())
        .map_or(1, LabError::exit_code)
}
