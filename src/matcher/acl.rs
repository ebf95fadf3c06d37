//! CIDR-based access control lists.

use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{GantryError, GantryResult};

/// One CIDR network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Whether `ip` falls inside this network. Families must match.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                prefix_match(&net.octets(), &ip.octets(), self.prefix)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                prefix_match(&net.octets(), &ip.octets(), self.prefix)
            }
            _ => false,
        }
    }
}

fn prefix_match(net: &[u8], ip: &[u8], prefix: u8) -> bool {
    let full = (prefix / 8) as usize;
    let rem = prefix % 8;
    if net[..full] != ip[..full] {
        return false;
    }
    if rem == 0 {
        return true;
    }
    let mask = !0u8 << (8 - rem);
    (net[full] & mask) == (ip[full] & mask)
}

impl FromStr for Cidr {
    type Err = GantryError;

    /// Parse `addr/prefix`; a bare address gets a host prefix
    fn from_str(s: &str) -> GantryResult<Self> {
        let (addr_str, prefix_str) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: IpAddr = addr_str
            .parse()
            .map_err(|_| GantryError::config(format!("bad CIDR address: {}", s)))?;
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix = match prefix_str {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|&p| p <= max)
                .ok_or_else(|| GantryError::config(format!("bad CIDR prefix: {}", s)))?,
            None => max,
        };
        Ok(Cidr { addr, prefix })
    }
}

/// A named list of CIDRs; membership is the OR over all of them
#[derive(Debug, Clone, Default)]
pub struct Acl {
    cidrs: Vec<Cidr>,
}

impl Acl {
    pub fn new(specs: &[String]) -> GantryResult<Acl> {
        let cidrs = specs
            .iter()
            .map(|s| s.parse())
            .collect::<GantryResult<Vec<_>>>()?;
        Ok(Acl { cidrs })
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        self.cidrs.iter().any(|c| c.contains(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.cidrs.is_empty()
    }
}
