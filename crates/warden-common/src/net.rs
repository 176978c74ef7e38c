//! Subnet keying for coordinated-attack detection.
//!
//! IPv4 sources are grouped at /24 and /16. IPv6 sources use the customary
//! /48 and /32 allocation boundaries so the same coordination logic applies.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

/// A masked network address identifying a subnet aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubnetKey {
    pub network: IpAddr,
    pub prefix: u8,
}

impl SubnetKey {
    pub fn new(ip: IpAddr, v4_prefix: u8, v6_prefix: u8) -> Self {
        match ip {
            IpAddr::V4(v4) => {
                let bits = u32::from(v4) & mask_v4(v4_prefix);
                Self {
                    network: IpAddr::V4(Ipv4Addr::from(bits)),
                    prefix: v4_prefix,
                }
            }
            IpAddr::V6(v6) => {
                let bits = u128::from(v6) & mask_v6(v6_prefix);
                Self {
                    network: IpAddr::V6(Ipv6Addr::from(bits)),
                    prefix: v6_prefix,
                }
            }
        }
    }

    pub fn to_network(self) -> Option<IpNetwork> {
        IpNetwork::new(self.network, self.prefix).ok()
    }
}

impl fmt::Display for SubnetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// The fine-grained aggregate: /24 for IPv4, /48 for IPv6.
pub fn subnet24(ip: IpAddr) -> SubnetKey {
    SubnetKey::new(ip, 24, 48)
}

/// The coarse aggregate: /16 for IPv4, /32 for IPv6.
pub fn subnet16(ip: IpAddr) -> SubnetKey {
    SubnetKey::new(ip, 16, 32)
}

fn mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    }
}

fn mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix as u32)
    }
}

/// Hostname sanity check for inbound handshake metadata. Anything failing
/// this is treated as a violation, not an error.
pub fn hostname_is_malformed(hostname: &str) -> bool {
    hostname.is_empty()
        || hostname.len() > 253
        || hostname.chars().any(|c| c.is_control() || c == ' ')
}
