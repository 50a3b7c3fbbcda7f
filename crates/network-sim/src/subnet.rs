use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{Context, Result, bail};

/// Host offset of peer 1's address is `PEER_ADDR_OFFSET + 1`.
pub const PEER_ADDR_OFFSET: u32 = 10;

/// An IPv4 subnet in CIDR notation, e.g. `10.10.0.0/24`.
///
/// The first host address is the bridge gateway; peer `i` lives at
/// `base + 10 + i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    base: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    /// Build a subnet, masking host bits off `addr`.
    ///
    /// Prefixes longer than /30 leave no room for a gateway and a peer.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 30 {
            bail!("subnet prefix /{prefix} too long (max /30)");
        }
        let mask = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        };
        Ok(Self {
            base: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    /// Number of usable host addresses (network and broadcast excluded).
    pub fn host_capacity(&self) -> u32 {
        let size = 1u64 << (32 - u32::from(self.prefix));
        (size - 2) as u32
    }

    /// Host address at `offset` from the network base.
    pub fn host(&self, offset: u32) -> Result<Ipv4Addr> {
        if offset == 0 || offset > self.host_capacity() {
            bail!("host offset {offset} outside {self}");
        }
        Ok(Ipv4Addr::from(u32::from(self.base) + offset))
    }

    /// Bridge gateway address (`base + 1`).
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.base) + 1)
    }

    /// Deterministic address of peer `index` (1-based).
    pub fn peer_address(&self, index: usize) -> Result<Ipv4Addr> {
        let index = u32::try_from(index).context("peer index overflows u32")?;
        self.host(PEER_ADDR_OFFSET + index)
            .with_context(|| format!("no address for peer {index}"))
    }

    /// Largest peer count whose addresses fit in this subnet.
    pub fn max_peers(&self) -> usize {
        self.host_capacity().saturating_sub(PEER_ADDR_OFFSET) as usize
    }

    /// `addr/prefix` form for `ip addr add`.
    pub fn cidr_of(&self, addr: Ipv4Addr) -> String {
        format!("{addr}/{}", self.prefix)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix)
    }
}

impl FromStr for Subnet {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .with_context(|| format!("subnet '{s}' is not in CIDR form"))?;
        let addr: Ipv4Addr = addr
            .parse()
            .with_context(|| format!("invalid subnet address '{addr}'"))?;
        let prefix: u8 = prefix
            .parse()
            .with_context(|| format!("invalid subnet prefix '{prefix}'"))?;
        if prefix > 32 {
            bail!("subnet prefix /{prefix} out of range");
        }
        Self::new(addr, prefix)
    }
}
