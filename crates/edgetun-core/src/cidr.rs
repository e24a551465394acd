//! CDN edge CIDR tables and the address classifier built from them.
//!
//! The tables are parsed once by [`AddressClassifier::new`] (or
//! [`AddressClassifier::cloudflare`] for the published edge list) and are
//! read-only afterwards, so a classifier can be shared through an `Arc`
//! without any locking.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::{EdgeError, EdgeResult};

/// Published IPv4 edge ranges of the target CDN.
pub const CLOUDFLARE_V4: &[&str] = &[
    "173.245.48.0/20",
    "103.21.244.0/22",
    "103.22.200.0/22",
    "103.31.4.0/22",
    "141.101.64.0/18",
    "108.162.192.0/18",
    "190.93.240.0/20",
    "188.114.96.0/20",
    "197.234.240.0/22",
    "198.41.128.0/17",
    "162.158.0.0/15",
    "104.16.0.0/13",
    "104.24.0.0/14",
    "172.64.0.0/13",
    "131.0.72.0/22",
];

/// Published IPv6 edge ranges of the target CDN.
pub const CLOUDFLARE_V6: &[&str] = &[
    "2400:cb00::/32",
    "2606:4700::/32",
    "2803:f800::/32",
    "2405:b500::/32",
    "2405:8100::/32",
    "2a06:98c0::/29",
    "2c0f:f248::/32",
];

/// A single CIDR block.
///
/// The network address is stored already masked, so membership is a single
/// AND and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cidr {
    V4 { network: u32, mask: u32, prefix_len: u8 },
    V6 { network: u128, mask: u128, prefix_len: u8 },
}

fn mask_v4(prefix_len: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0)
}

fn mask_v6(prefix_len: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(prefix_len)).unwrap_or(0)
}

impl Cidr {
    /// Parse `addr/len`, e.g. `"104.16.0.0/13"` or `"2606:4700::/32"`.
    pub fn parse(s: &str) -> EdgeResult<Self> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| EdgeError::InvalidCidr(format!("missing prefix length in {s}")))?;
        let prefix_len: u8 = len
            .parse()
            .map_err(|_| EdgeError::InvalidCidr(format!("bad prefix length in {s}")))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| EdgeError::InvalidCidr(format!("bad network address in {s}")))?;

        match addr {
            IpAddr::V4(v4) => {
                if prefix_len > 32 {
                    return Err(EdgeError::InvalidCidr(format!("prefix too long in {s}")));
                }
                let mask = mask_v4(prefix_len);
                Ok(Cidr::V4 {
                    network: u32::from(v4) & mask,
                    mask,
                    prefix_len,
                })
            }
            IpAddr::V6(v6) => {
                if prefix_len > 128 {
                    return Err(EdgeError::InvalidCidr(format!("prefix too long in {s}")));
                }
                let mask = mask_v6(prefix_len);
                Ok(Cidr::V6 {
                    network: u128::from(v6) & mask,
                    mask,
                    prefix_len,
                })
            }
        }
    }

    /// Whether `ip` falls inside this block. Families never cross-match.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (Cidr::V4 { network, mask, .. }, IpAddr::V4(v4)) => u32::from(v4) & mask == *network,
            (Cidr::V6 { network, mask, .. }, IpAddr::V6(v6)) => u128::from(v6) & mask == *network,
            _ => false,
        }
    }

    /// First address of the block.
    pub fn first(&self) -> IpAddr {
        match *self {
            Cidr::V4 { network, .. } => IpAddr::V4(Ipv4Addr::from(network)),
            Cidr::V6 { network, .. } => IpAddr::V6(Ipv6Addr::from(network)),
        }
    }

    /// Last address of the block.
    pub fn last(&self) -> IpAddr {
        match *self {
            Cidr::V4 { network, mask, .. } => IpAddr::V4(Ipv4Addr::from(network | !mask)),
            Cidr::V6 { network, mask, .. } => IpAddr::V6(Ipv6Addr::from(network | !mask)),
        }
    }
}

impl FromStr for Cidr {
    type Err = EdgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cidr::parse(s)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cidr::V4 { prefix_len, .. } | Cidr::V6 { prefix_len, .. } => {
                write!(f, "{}/{}", self.first(), prefix_len)
            }
        }
    }
}

/// Immutable membership test over the target network's edge ranges.
#[derive(Debug, Clone)]
pub struct AddressClassifier {
    v4: Vec<Cidr>,
    v6: Vec<Cidr>,
}

impl AddressClassifier {
    /// Build a classifier from CIDR strings. Entries are sorted into the v4
    /// or v6 table by the family of their network address.
    pub fn new<'a>(ranges: impl IntoIterator<Item = &'a str>) -> EdgeResult<Self> {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for range in ranges {
            let cidr = Cidr::parse(range)?;
            match cidr {
                Cidr::V4 { .. } => v4.push(cidr),
                Cidr::V6 { .. } => v6.push(cidr),
            }
        }
        Ok(Self { v4, v6 })
    }

    /// Classifier over the published CDN edge list.
    pub fn cloudflare() -> Self {
        Self::new(CLOUDFLARE_V4.iter().chain(CLOUDFLARE_V6).copied())
            .expect("published edge ranges are valid CIDR literals")
    }

    /// Whether `ip` belongs to the target network.
    ///
    /// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are checked against the
    /// IPv4 table.
    pub fn is_member(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(_) => self.v4.iter().any(|c| c.contains(ip)),
            // `::ffff:a.b.c.d` is the IPv4 host it embeds; none of the v6
            // prefixes cover `::ffff:0:0/96`, so a pure 128-bit compare
            // would always call it a non-member.
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => self.is_member(IpAddr::V4(v4)),
                None => self.v6.iter().any(|c| c.contains(ip)),
            },
        }
    }

    /// Parse `ip` as a literal (optionally `[bracketed]`) and test membership.
    /// Anything that is not an IP literal is not a member.
    pub fn is_member_str(&self, ip: &str) -> bool {
        parse_ip_literal(ip).is_some_and(|ip| self.is_member(ip))
    }

    /// All configured ranges, v4 first.
    pub fn ranges(&self) -> impl Iterator<Item = &Cidr> {
        self.v4.iter().chain(self.v6.iter())
    }
}

/// Parse an IP literal, accepting the `[v6]` form SOCKS clients sometimes send.
pub fn parse_ip_literal(s: &str) -> Option<IpAddr> {
    let trimmed = s
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(s);
    trimmed.parse().ok()
}
