//! gossip-lab library
//!
//! Orchestrates experiments with an external gossip peer binary across a
//! bridge of network namespaces: bootstrap selection and readiness, ordered
//! launches, scheduled churn, network impairment, and per-run result
//! directories. The namespace substrate itself lives in `network-sim`.

// Use mimalloc as the global allocator for tests (non-Windows only)
#[cfg(not(windows))]
#[cfg(test)]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod bootstrap;
pub mod churn;
pub mod collector;
pub mod config;
pub mod error;
pub mod mode;
pub mod orchestrator;
pub mod peer;
pub mod readiness;
pub mod testbed;
pub mod utils;

// Re-export commonly used items
pub use bootstrap::{BootstrapPolicy, BootstrapSet};
pub use churn::{ChurnSchedule, ChurnSelection};
pub use collector::{Manifest, PeerFiles, RunDir};
pub use config::{Cli, LabConfig};
pub use error::{LabError, exit_code_of};
pub use mode::{DiscoveryMode, Role};
pub use orchestrator::{Orchestrator, RunReport, RunSettings};
pub use peer::{LaunchSpec, Launched, NetnsLauncher, PeerLauncher, PeerProcess, ProcessExit};
pub use readiness::ReadinessBudget;
pub use testbed::{NetnsTestbed, Testbed, TestbedGuard};
pub use utils::CancelToken;
