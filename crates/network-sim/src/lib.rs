//! Bridge-and-namespace testbeds for multi-peer experiments.
//!
//! Uses Linux network namespaces, a shared bridge and `tc netem` to give
//! every emulated peer its own isolated network context with configurable
//! delay and loss.
//!
//! # Modules
//!
//! - [`subnet`]: CIDR parsing and deterministic peer addressing
//! - [`topology`]: Bridge, namespace and veth management, internet egress
//! - [`impairment`]: `tc netem` profiles and application
//! - [`scenario`]: Run-wide network scenarios expanded into per-link plans
//! - [`process`]: Managed child processes inside namespaces, dependency checks
//! - [`test_util`]: Privilege checks and unique name generation

pub mod impairment;
pub mod process;
pub mod scenario;
pub mod subnet;
pub mod test_util;
pub mod topology;

pub use impairment::{ImpairmentConfig, ImpairmentProfile, apply_impairment, clear_impairment};
pub use process::{
    NamespaceProcess, ProcessIo, SkipReason, check_binary, check_lab_deps, check_netem,
    resolve_program,
};
pub use scenario::{LinkImpairment, LinkTarget, NetworkScenario, apply_plan, clear_plan};
pub use subnet::Subnet;
pub use test_util::{check_privileges, unique_ns_name};
pub use topology::{
    BridgeTopology, EgressConfig, Host, Namespace, NetContext, PEER_IFACE, PeerLink,
    TopologyConfig,
};
