// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use chrono::{DateTime, Utc};
use num_enum::TryFromPrimitive;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An address-family / subsequent-address-family identifier pair. Identifies
/// which kind of routes a session carries.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct RouteFamily {
    pub afi: u16,
    pub safi: u8,
}

impl RouteFamily {
    pub const IPV4_UNICAST: RouteFamily = RouteFamily { afi: 1, safi: 1 };
    pub const IPV6_UNICAST: RouteFamily = RouteFamily { afi: 2, safi: 1 };

    /// The 32-bit key form `afi << 16 | safi`.
    pub fn key(&self) -> u32 {
        (self.afi as u32) << 16 | self.safi as u32
    }
}

impl fmt::Display for RouteFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RouteFamily::IPV4_UNICAST => write!(f, "ipv4-unicast"),
            RouteFamily::IPV6_UNICAST => write!(f, "ipv6-unicast"),
            RouteFamily { afi, safi } => write!(f, "afi-{}-safi-{}", afi, safi),
        }
    }
}

impl FromStr for RouteFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ipv4-unicast" => Ok(RouteFamily::IPV4_UNICAST),
            "ipv6-unicast" => Ok(RouteFamily::IPV6_UNICAST),
            _ => Err(Error::InvalidRouteFamily(s.into())),
        }
    }
}

/// An autonomous system number.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum Asn {
    TwoOctet(u16),
    FourOctet(u32),
}

impl Asn {
    pub fn as_u32(&self) -> u32 {
        match self {
            Self::TwoOctet(value) => u32::from(*value),
            Self::FourOctet(value) => *value,
        }
    }
}

impl fmt::Display for Asn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Asn::TwoOctet(asn) => write!(f, "{}", asn),
            Asn::FourOctet(asn) => write!(f, "{}", asn),
        }
    }
}

impl From<u32> for Asn {
    fn from(value: u32) -> Asn {
        Asn::FourOctet(value)
    }
}

impl From<u16> for Asn {
    fn from(value: u16) -> Asn {
        Asn::TwoOctet(value)
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct Prefix4 {
    pub value: Ipv4Addr,
    pub length: u8,
}

impl Prefix4 {
    /// True if this prefix covers `other`, i.e. `other` is equal to or more
    /// specific than `self`.
    pub fn covers(&self, other: &Prefix4) -> bool {
        if other.length < self.length {
            return false;
        }
        if self.length == 0 {
            return true;
        }
        let mask = u32::MAX << (32 - self.length);
        (u32::from(self.value) & mask) == (u32::from(other.value) & mask)
    }
}

impl fmt::Display for Prefix4 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.length)
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct Prefix6 {
    pub value: Ipv6Addr,
    pub length: u8,
}

impl Prefix6 {
    pub fn covers(&self, other: &Prefix6) -> bool {
        if other.length < self.length {
            return false;
        }
        if self.length == 0 {
            return true;
        }
        let mask = u128::MAX << (128 - self.length);
        (u128::from(self.value) & mask) == (u128::from(other.value) & mask)
    }
}

impl fmt::Display for Prefix6 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.length)
    }
}

/// An IPv4 or IPv6 prefix.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub enum Prefix {
    V4(Prefix4),
    V6(Prefix6),
}

impl Prefix {
    pub fn family(&self) -> RouteFamily {
        match self {
            Prefix::V4(_) => RouteFamily::IPV4_UNICAST,
            Prefix::V6(_) => RouteFamily::IPV6_UNICAST,
        }
    }

    pub fn covers(&self, other: &Prefix) -> bool {
        match (self, other) {
            (Prefix::V4(a), Prefix::V4(b)) => a.covers(b),
            (Prefix::V6(a), Prefix::V6(b)) => a.covers(b),
            _ => false,
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Prefix::V4(p) => p.fmt(f),
            Prefix::V6(p) => p.fmt(f),
        }
    }
}

impl FromStr for Prefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidPrefix(s.into()))?;
        let length: u8 =
            len.parse().map_err(|_| Error::InvalidPrefix(s.into()))?;
        match addr.parse::<IpAddr>() {
            Ok(IpAddr::V4(value)) if length <= 32 => {
                Ok(Prefix::V4(Prefix4 { value, length }))
            }
            Ok(IpAddr::V6(value)) if length <= 128 => {
                Ok(Prefix::V6(Prefix6 { value, length }))
            }
            _ => Err(Error::InvalidPrefix(s.into())),
        }
    }
}

/// Identifies the origin of a path inside the speaker: the autonomous system,
/// router-id and address of the peer the path was learned from.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct PeerInfo {
    pub asn: u32,
    pub id: u32,
    pub address: IpAddr,
}

/// Path origin attribute values per RFC 4271 §5.1.1.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    TryFromPrimitive,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[repr(u8)]
pub enum PathOrigin {
    Igp = 0,
    Egp = 1,
    Incomplete = 2,
}

/// A single route with its digested attributes. Paths are value types that
/// move between session actors; the withdraw flag distinguishes removals
/// from announcements.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Path {
    pub family: RouteFamily,
    pub nlri: Prefix,
    pub origin: PathOrigin,
    pub as_path: Vec<u32>,
    pub nexthop: Option<IpAddr>,
    pub med: Option<u32>,
    pub local_pref: Option<u32>,
    pub communities: Vec<u32>,
    pub withdraw: bool,
    pub source: PeerInfo,
    pub timestamp: DateTime<Utc>,
}

impl Path {
    pub fn new(family: RouteFamily, nlri: Prefix, source: PeerInfo) -> Self {
        Self {
            family,
            nlri,
            origin: PathOrigin::Incomplete,
            as_path: Vec::new(),
            nexthop: None,
            med: None,
            local_pref: None,
            communities: Vec::new(),
            withdraw: false,
            source,
            timestamp: Utc::now(),
        }
    }

    pub fn withdrawn(mut self) -> Self {
        self.withdraw = true;
        self
    }

    /// Deterministic preference ordering used by the decision process:
    /// higher local-pref, then shorter AS path, then lower MED, then lowest
    /// originating peer address.
    pub fn cmp_preference(&self, other: &Path) -> Ordering {
        other
            .local_pref
            .unwrap_or(100)
            .cmp(&self.local_pref.unwrap_or(100))
            .then(self.as_path.len().cmp(&other.as_path.len()))
            .then(self.med.unwrap_or(0).cmp(&other.med.unwrap_or(0)))
            .then(self.source.address.cmp(&other.source.address))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_parse_and_cover() {
        let p: Prefix = "10.0.0.0/8".parse().unwrap();
        let q: Prefix = "10.1.0.0/16".parse().unwrap();
        let r: Prefix = "11.0.0.0/8".parse().unwrap();
        assert!(p.covers(&q));
        assert!(!q.covers(&p));
        assert!(!p.covers(&r));

        let all: Prefix = "0.0.0.0/0".parse().unwrap();
        assert!(all.covers(&p));
        assert!(all.covers(&all));

        let v6: Prefix = "fd00::/8".parse().unwrap();
        assert!(!p.covers(&v6));
        assert!("300.0.0.0/8".parse::<Prefix>().is_err());
        assert!("10.0.0.0/33".parse::<Prefix>().is_err());
        assert!("10.0.0.0".parse::<Prefix>().is_err());
    }

    #[test]
    fn route_family_key() {
        assert_eq!(RouteFamily::IPV4_UNICAST.key(), 0x0001_0001);
        assert_eq!(RouteFamily::IPV6_UNICAST.key(), 0x0002_0001);
        assert_eq!(
            "ipv6-unicast".parse::<RouteFamily>().unwrap(),
            RouteFamily::IPV6_UNICAST
        );
    }

    #[test]
    fn preference_ordering() {
        let src = PeerInfo {
            asn: 65001,
            id: 1,
            address: "192.0.2.1".parse().unwrap(),
        };
        let nlri: Prefix = "10.0.0.0/24".parse().unwrap();
        let mut a = Path::new(RouteFamily::IPV4_UNICAST, nlri, src);
        a.as_path = vec![65001];
        let mut b = a.clone();
        b.as_path = vec![65001, 65002];
        assert_eq!(a.cmp_preference(&b), Ordering::Less);

        b.local_pref = Some(200);
        assert_eq!(a.cmp_preference(&b), Ordering::Greater);
    }
}
