//! IP network values shared by VIPs, routes and the FIB.

use std::fmt;
use std::net::IpAddr;

/// IP protocol version, keying the per-version route managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpVersion::V4 => write!(f, "4"),
            IpVersion::V6 => write!(f, "6"),
        }
    }
}

/// An address with a prefix length: a VIP, a route destination, a RA prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IpNet {
    pub ip: IpAddr,
    pub prefix_len: u8,
}

impl IpNet {
    pub fn new(ip: IpAddr, prefix_len: u8) -> Self {
        Self { ip, prefix_len }
    }

    /// The full-length network holding exactly `ip`.
    pub fn host(ip: IpAddr) -> Self {
        let prefix_len = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self { ip, prefix_len }
    }

    /// True when this is a single-host network.
    pub fn is_host(&self) -> bool {
        self.prefix_len == Self::host(self.ip).prefix_len
    }

    pub fn version(&self) -> IpVersion {
        IpVersion::of(&self.ip)
    }

    /// True when `addr` falls inside this network.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.ip, addr) {
            (IpAddr::V4(net), IpAddr::V4(other)) => {
                let mask = prefix_mask_v4(self.prefix_len);
                u32::from(net) & mask == u32::from(*other) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(other)) => {
                let mask = prefix_mask_v6(self.prefix_len);
                u128::from(net) & mask == u128::from(*other) & mask
            }
            _ => false,
        }
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_len)
    }
}

fn prefix_mask_v4(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len.min(32)))
    }
}

fn prefix_mask_v6(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix_len.min(128)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str, len: u8) -> IpNet {
        IpNet::new(s.parse().unwrap(), len)
    }

    #[test]
    fn test_v4_contains() {
        let vip = net("10.0.0.254", 24);
        assert!(vip.contains(&"10.0.0.1".parse().unwrap()));
        assert!(!vip.contains(&"10.0.1.1".parse().unwrap()));
        assert!(!vip.contains(&"fc00::1".parse().unwrap()));
    }

    #[test]
    fn test_v6_contains() {
        let vip = net("fc00::254", 64);
        assert!(vip.contains(&"fc00::9".parse().unwrap()));
        assert!(!vip.contains(&"fc01::9".parse().unwrap()));
    }

    #[test]
    fn test_zero_prefix_contains_everything() {
        let all = net("0.0.0.0", 0);
        assert!(all.contains(&"203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_display() {
        assert_eq!(net("10.0.0.254", 24).to_string(), "10.0.0.254/24");
    }
}
