// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

/// An IP prefix in CIDR notation.
///
/// The network address is canonicalized on construction; `10.8.0.5/24`
/// stores as `10.8.0.0/24`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Cidr {
    network: IpAddr,
    prefix_len: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CidrParseError {
    #[error("invalid IP address")]
    Address,
    #[error("invalid prefix length")]
    PrefixLen,
}

impl Cidr {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, CidrParseError> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(CidrParseError::PrefixLen);
        }
        let network = match addr {
            IpAddr::V4(v4) => {
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & v4_mask(prefix_len)))
            }
            IpAddr::V6(v6) => {
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & v6_mask(prefix_len)))
            }
        };
        Ok(Self {
            network,
            prefix_len,
        })
    }

    /// The /32 (or /128) prefix covering exactly `addr`
    pub fn host(addr: IpAddr) -> Self {
        let prefix_len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self {
            network: addr,
            prefix_len,
        }
    }

    #[inline]
    pub const fn network(&self) -> IpAddr {
        self.network
    }

    #[inline]
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Whether `addr` falls inside this prefix. Mixed address families never
    /// match.
    #[inline]
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(network), IpAddr::V4(addr)) => {
                u32::from(addr) & v4_mask(self.prefix_len) == u32::from(network)
            }
            (IpAddr::V6(network), IpAddr::V6(addr)) => {
                u128::from(addr) & v6_mask(self.prefix_len) == u128::from(network)
            }
            _ => false,
        }
    }

    /// The host address at `offset` within the prefix, if it fits.
    ///
    /// Offset 0 is the network address itself.
    pub fn host_at(&self, offset: u32) -> Option<IpAddr> {
        match self.network {
            IpAddr::V4(network) => {
                let capacity = 1u64 << (32 - self.prefix_len as u64);
                if u64::from(offset) >= capacity {
                    return None;
                }
                Some(IpAddr::V4(Ipv4Addr::from(u32::from(network) + offset)))
            }
            IpAddr::V6(network) => {
                if self.prefix_len > 96 && u128::from(offset) >= 1u128 << (128 - self.prefix_len) {
                    return None;
                }
                Some(IpAddr::V6(Ipv6Addr::from(
                    u128::from(network) + u128::from(offset),
                )))
            }
        }
    }
}

#[inline]
const fn v4_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    }
}

#[inline]
const fn v6_mask(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for Cidr {
    type Err = CidrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((addr, len)) => {
                let addr: IpAddr = addr.parse().map_err(|_| CidrParseError::Address)?;
                let len: u8 = len.parse().map_err(|_| CidrParseError::PrefixLen)?;
                Self::new(addr, len)
            }
            None => {
                let addr: IpAddr = s.parse().map_err(|_| CidrParseError::Address)?;
                Ok(Self::host(addr))
            }
        }
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Cidr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Cidr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The set of source prefixes a peer may claim.
///
/// An empty set disables filtering entirely; that matches peers whose
/// configuration predates per-peer routes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllowedSources {
    prefixes: Vec<Cidr>,
}

impl AllowedSources {
    pub fn new(prefixes: Vec<Cidr>) -> Self {
        Self { prefixes }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    #[inline]
    pub fn prefixes(&self) -> &[Cidr] {
        &self.prefixes
    }

    /// Whether a decrypted packet claiming `source` is acceptable
    #[inline]
    pub fn is_allowed(&self, source: IpAddr) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|prefix| prefix.contains(source))
    }

    /// Whether `destination` routes to the owner of this set
    #[inline]
    pub fn covers(&self, destination: IpAddr) -> bool {
        self.prefixes.iter().any(|prefix| prefix.contains(destination))
    }
}

impl FromIterator<Cidr> for AllowedSources {
    fn from_iter<I: IntoIterator<Item = Cidr>>(iter: I) -> Self {
        Self {
            prefixes: iter.into_iter().collect(),
        }
    }
}
