//! IP and CIDR matching plus requester IP extraction

use http::HeaderMap;
use std::net::IpAddr;
use std::str::FromStr;

/// A parsed CIDR range; a bare address is a full-length prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (network, prefix_len) = match s.split_once('/') {
            Some((addr, prefix)) => (IpAddr::from_str(addr).ok()?, prefix.parse().ok()?),
            None => {
                let network = IpAddr::from_str(s).ok()?;
                (network, max_prefix(&network))
            }
        };

        if prefix_len > max_prefix(&network) {
            return None;
        }

        Some(Self { network, prefix_len })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(check)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    !0u32 << (32 - self.prefix_len)
                };
                (u32::from(*net) & mask) == (u32::from(*check) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(check)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    !0u128 << (128 - self.prefix_len)
                };
                (u128::from(*net) & mask) == (u128::from(*check) & mask)
            }
            // Mapped IPv4 addresses are compared in their IPv4 form
            (IpAddr::V4(_), IpAddr::V6(check)) => check
                .to_ipv4_mapped()
                .is_some_and(|v4| self.contains(&IpAddr::V4(v4))),
            _ => false,
        }
    }
}

fn max_prefix(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// A set of addresses and ranges
#[derive(Debug, Clone, Default)]
pub struct IpSet {
    ranges: Vec<CidrRange>,
}

impl IpSet {
    /// Build from entries, silently skipping anything that is not an IP or CIDR
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Self {
        Self {
            ranges: entries
                .iter()
                .filter_map(|s| CidrRange::parse(s.as_ref()))
                .collect(),
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.ranges.iter().any(|r| r.contains(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Determine the requesting client's IP.
///
/// Priority:
/// 1. X-Real-IP
/// 2. CF-Connecting-IP
/// 3. Fastly-Client-IP
/// 4. X-Forwarded-For (first entry)
/// 5. Socket peer address
pub fn requester_ip(headers: &HeaderMap, remote_addr: Option<IpAddr>) -> Option<IpAddr> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    for name in ["x-real-ip", "cf-connecting-ip", "fastly-client-ip"] {
        if let Some(ip) = header(name).and_then(parse_ip) {
            return Some(ip);
        }
    }

    if let Some(ip) = header("x-forwarded-for")
        .and_then(|xff| xff.split(',').next())
        .and_then(parse_ip)
    {
        return Some(ip);
    }

    remote_addr
}

/// Parse an address that may carry a port ("1.2.3.4:80", "[::1]:8080")
fn parse_ip(s: &str) -> Option<IpAddr> {
    let s = s.trim();
    if let Ok(ip) = IpAddr::from_str(s) {
        return Some(ip);
    }
    let (ip, _) = s.rsplit_once(':')?;
    let ip = ip
        .strip_prefix('[')
        .and_then(|i| i.strip_suffix(']'))
        .unwrap_or(ip);
    IpAddr::from_str(ip).ok()
}
