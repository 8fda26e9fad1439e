use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{Result, TransportError};

/// An IPv4 interface address with its prefix, parsed from `a.b.c.d/n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Net {
    addr: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Net {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 32 {
            return Err(TransportError::config(format!(
                "prefix length {prefix_len} exceeds 32"
            )));
        }
        Ok(Self { addr, prefix_len })
    }

    /// Parse `a.b.c.d/n`. The string must contain exactly one `/`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let mut parts = s.split('/');
        let (Some(addr), Some(prefix), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(TransportError::config(format!(
                "invalid IPv4 address {s:?}: expected a.b.c.d/n"
            )));
        };
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|e| TransportError::config(format!("invalid IPv4 address {addr:?}: {e}")))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|e| TransportError::config(format!("invalid prefix {prefix:?}: {e}")))?;
        Self::new(addr, prefix_len)
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Netmask with `prefix_len` leading one-bits.
    pub fn netmask(&self) -> Ipv4Addr {
        let bits = u32::MAX
            .checked_shl(32 - u32::from(self.prefix_len))
            .unwrap_or(0);
        Ipv4Addr::from(bits)
    }

    /// Network address (`addr & netmask`).
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & u32::from(self.netmask()))
    }

    /// Whether `ip` is on this subnet.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask());
        u32::from(ip) & mask == u32::from(self.addr) & mask
    }
}

impl FromStr for Ipv4Net {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}
