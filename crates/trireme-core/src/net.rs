//! IPv4 CIDR parsing and prefix matching.
//!
//! The datapath gates interception on target and excluded networks, so
//! membership checks run on the packet path and must be allocation-free.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when parsing a CIDR string.
#[derive(Debug, Error)]
pub enum CidrError {
    /// The string was not `a.b.c.d` or `a.b.c.d/len`.
    #[error("invalid CIDR: {input}")]
    Invalid {
        /// The rejected input.
        input: String,
    },

    /// The prefix length exceeded 32.
    #[error("invalid prefix length {len} in {input}")]
    PrefixLength {
        /// The rejected prefix length.
        len: u8,
        /// The rejected input.
        input: String,
    },
}

/// An IPv4 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CidrV4 {
    addr: Ipv4Addr,
    prefix: u8,
}

impl CidrV4 {
    /// Creates a network from an address and prefix length.
    ///
    /// # Errors
    ///
    /// Returns [`CidrError::PrefixLength`] if `prefix > 32`.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, CidrError> {
        if prefix > 32 {
            return Err(CidrError::PrefixLength {
                len: prefix,
                input: format!("{addr}/{prefix}"),
            });
        }
        Ok(Self { addr, prefix })
    }

    /// Returns `true` if `ip` falls inside this network.
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        };
        (u32::from(ip) & mask) == (u32::from(self.addr) & mask)
    }

    /// The network address.
    #[must_use]
    pub const fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// The prefix length.
    #[must_use]
    pub const fn prefix(&self) -> u8 {
        self.prefix
    }
}

impl fmt::Display for CidrV4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for CidrV4 {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CidrError::Invalid {
            input: s.to_string(),
        };

        match s.split_once('/') {
            Some((addr, len)) => {
                let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
                let len: u8 = len.parse().map_err(|_| invalid())?;
                Self::new(addr, len)
            },
            // A bare address is a /32 host route.
            None => {
                let addr: Ipv4Addr = s.parse().map_err(|_| invalid())?;
                Self::new(addr, 32)
            },
        }
    }
}

impl TryFrom<String> for CidrV4 {
    type Error = CidrError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CidrV4> for String {
    fn from(c: CidrV4) -> Self {
        c.to_string()
    }
}

/// Returns `true` if any network in `networks` contains `ip`.
#[must_use]
pub fn any_contains(networks: &[CidrV4], ip: Ipv4Addr) -> bool {
    networks.iter().any(|n| n.contains(ip))
}
