//! Discovery mode and peer role enums passed to the peer binary.

use std::fmt;

use serde::Serialize;

/// How peers locate each other.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Local/direct discovery (mDNS-style on the shared bridge).
    #[default]
    Direct,

    /// Relay-assisted discovery.
    Relay,
}

impl DiscoveryMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            DiscoveryMode::Direct => "direct",
            DiscoveryMode::Relay => "relay",
        }
    }
}

impl fmt::Display for DiscoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DiscoveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(DiscoveryMode::Direct),
            "relay" => Ok(DiscoveryMode::Relay),
            _ => Err(format!("invalid discovery mode '{s}': use direct or relay")),
        }
    }
}

impl clap::ValueEnum for DiscoveryMode {
    fn value_variants<'a>() -> &'a [Self] {
        &[DiscoveryMode::Direct, DiscoveryMode::Relay]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }
}

/// Role a peer process plays in a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
