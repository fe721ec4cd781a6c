//! The IPv6/ICMPv6 subset the control plane answers: neighbor discovery,
//! router advertisement and echo.

use std::net::Ipv6Addr;

use crate::ipv4::checksum;
use crate::mac::MacAddress;
use crate::{PacketError, Result};

pub const IPV6_HEADER_LEN: usize = 40;
pub const PROTO_ICMPV6: u8 = 58;

pub const ND_ROUTER_SOLICIT: u8 = 133;
pub const ND_ROUTER_ADVERT: u8 = 134;
pub const ND_NEIGHBOR_SOLICIT: u8 = 135;
pub const ND_NEIGHBOR_ADVERT: u8 = 136;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

const OPT_SOURCE_LINK_ADDR: u8 = 1;
const OPT_TARGET_LINK_ADDR: u8 = 2;
const OPT_PREFIX_INFO: u8 = 3;

/// A decoded IPv6 header and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Packet {
    pub src_ip: Ipv6Addr,
    pub dst_ip: Ipv6Addr,
    pub next_header: u8,
    pub hop_limit: u8,
    pub payload: Vec<u8>,
}

impl Ipv6Packet {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < IPV6_HEADER_LEN {
            return Err(PacketError::Truncated {
                needed: IPV6_HEADER_LEN,
                have: payload.len(),
            });
        }
        let version = payload[0] >> 4;
        if version != 6 {
            return Err(PacketError::InvalidField {
                field: "ip version",
                value: version.to_string(),
            });
        }
        let src: [u8; 16] = payload[8..24].try_into().expect("length checked");
        let dst: [u8; 16] = payload[24..40].try_into().expect("length checked");
        Ok(Self {
            src_ip: Ipv6Addr::from(src),
            dst_ip: Ipv6Addr::from(dst),
            next_header: payload[6],
            hop_limit: payload[7],
            payload: payload[IPV6_HEADER_LEN..].to_vec(),
        })
    }

    pub fn build(
        src_ip: Ipv6Addr,
        dst_ip: Ipv6Addr,
        next_header: u8,
        hop_limit: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut data = vec![0u8; IPV6_HEADER_LEN];
        data[0] = 0x60;
        data[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        data[6] = next_header;
        data[7] = hop_limit;
        data[8..24].copy_from_slice(&src_ip.octets());
        data[24..40].copy_from_slice(&dst_ip.octets());
        data.extend_from_slice(payload);
        data
    }
}

/// ICMPv6 checksum over the RFC 8200 pseudo-header.
pub fn icmpv6_checksum(src: &Ipv6Addr, dst: &Ipv6Addr, icmp: &[u8]) -> u16 {
    let len = (icmp.len() as u32).to_be_bytes();
    let proto = [0u8, 0, 0, PROTO_ICMPV6];
    checksum(&[&src.octets(), &dst.octets(), &len, &proto, icmp])
}

/// A decoded ICMPv6 message of one of the handled types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Icmpv6Message {
    NeighborSolicit {
        target: Ipv6Addr,
        source_link_addr: Option<MacAddress>,
    },
    NeighborAdvert {
        target: Ipv6Addr,
        target_link_addr: Option<MacAddress>,
    },
    RouterSolicit,
    EchoRequest {
        /// Identifier, sequence and data, echoed verbatim.
        rest: Vec<u8>,
    },
    /// Any other type; carried so callers can ignore it explicitly.
    Other(u8),
}

impl Icmpv6Message {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 4 {
            return Err(PacketError::Truncated {
                needed: 4,
                have: payload.len(),
            });
        }
        let icmp_type = payload[0];
        match icmp_type {
            ND_NEIGHBOR_SOLICIT | ND_NEIGHBOR_ADVERT => {
                if payload.len() < 24 {
                    return Err(PacketError::Truncated {
                        needed: 24,
                        have: payload.len(),
                    });
                }
                let target_bytes: [u8; 16] =
                    payload[8..24].try_into().expect("length checked");
                let target = Ipv6Addr::from(target_bytes);
                let link_addr = parse_link_addr_option(&payload[24..]);
                if icmp_type == ND_NEIGHBOR_SOLICIT {
                    Ok(Self::NeighborSolicit {
                        target,
                        source_link_addr: link_addr,
                    })
                } else {
                    Ok(Self::NeighborAdvert {
                        target,
                        target_link_addr: link_addr,
                    })
                }
            }
            ND_ROUTER_SOLICIT => Ok(Self::RouterSolicit),
            ICMPV6_ECHO_REQUEST => Ok(Self::EchoRequest {
                rest: payload[4..].to_vec(),
            }),
            other => Ok(Self::Other(other)),
        }
    }
}

fn parse_link_addr_option(mut options: &[u8]) -> Option<MacAddress> {
    while options.len() >= 8 {
        let opt_type = options[0];
        let opt_len = usize::from(options[1]) * 8;
        if opt_len == 0 || opt_len > options.len() {
            return None;
        }
        if (opt_type == OPT_SOURCE_LINK_ADDR || opt_type == OPT_TARGET_LINK_ADDR) && opt_len >= 8
        {
            return Some(MacAddress::new(
                options[2..8].try_into().expect("length checked"),
            ));
        }
        options = &options[opt_len..];
    }
    None
}

fn finalize(src: &Ipv6Addr, dst: &Ipv6Addr, mut icmp: Vec<u8>) -> Vec<u8> {
    let csum = icmpv6_checksum(src, dst, &icmp);
    icmp[2..4].copy_from_slice(&csum.to_be_bytes());
    icmp
}

/// A solicited neighbor advertisement for `target` with the router and
/// solicited flags set.
pub fn build_neighbor_advert(
    src_ip: &Ipv6Addr,
    dst_ip: &Ipv6Addr,
    target: &Ipv6Addr,
    target_mac: MacAddress,
) -> Vec<u8> {
    let mut icmp = vec![ND_NEIGHBOR_ADVERT, 0, 0, 0];
    icmp.extend_from_slice(&[0xe0, 0, 0, 0]); // router|solicited|override
    icmp.extend_from_slice(&target.octets());
    icmp.extend_from_slice(&[OPT_TARGET_LINK_ADDR, 1]);
    icmp.extend_from_slice(target_mac.as_bytes());
    finalize(src_ip, dst_ip, icmp)
}

/// A router advertisement for one on-link, autonomous prefix.
pub fn build_router_advert(
    src_ip: &Ipv6Addr,
    dst_ip: &Ipv6Addr,
    source_mac: MacAddress,
    prefix: &Ipv6Addr,
    prefix_len: u8,
    lifetime_sec: u16,
) -> Vec<u8> {
    let mut icmp = vec![ND_ROUTER_ADVERT, 0, 0, 0];
    icmp.push(64); // cur hop limit
    icmp.push(0); // flags
    icmp.extend_from_slice(&lifetime_sec.to_be_bytes());
    icmp.extend_from_slice(&0u32.to_be_bytes()); // reachable time
    icmp.extend_from_slice(&0u32.to_be_bytes()); // retrans timer
    icmp.extend_from_slice(&[OPT_SOURCE_LINK_ADDR, 1]);
    icmp.extend_from_slice(source_mac.as_bytes());
    icmp.extend_from_slice(&[OPT_PREFIX_INFO, 4, prefix_len, 0xc0]); // on-link|autonomous
    icmp.extend_from_slice(&u32::from(lifetime_sec).to_be_bytes()); // valid lifetime
    icmp.extend_from_slice(&u32::from(lifetime_sec).to_be_bytes()); // preferred lifetime
    icmp.extend_from_slice(&0u32.to_be_bytes()); // reserved
    icmp.extend_from_slice(&prefix.octets());
    finalize(src_ip, dst_ip, icmp)
}

/// A neighbor solicitation for `target`, used to resolve gateways.
pub fn build_neighbor_solicit(
    src_ip: &Ipv6Addr,
    dst_ip: &Ipv6Addr,
    target: &Ipv6Addr,
    source_mac: MacAddress,
) -> Vec<u8> {
    let mut icmp = vec![ND_NEIGHBOR_SOLICIT, 0, 0, 0];
    icmp.extend_from_slice(&0u32.to_be_bytes());
    icmp.extend_from_slice(&target.octets());
    icmp.extend_from_slice(&[OPT_SOURCE_LINK_ADDR, 1]);
    icmp.extend_from_slice(source_mac.as_bytes());
    finalize(src_ip, dst_ip, icmp)
}

/// An echo reply carrying the request's identifier/sequence/data.
pub fn build_echo_reply(src_ip: &Ipv6Addr, dst_ip: &Ipv6Addr, rest: &[u8]) -> Vec<u8> {
    let mut icmp = vec![ICMPV6_ECHO_REPLY, 0, 0, 0];
    icmp.extend_from_slice(rest);
    finalize(src_ip, dst_ip, icmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn addr(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_ipv6_roundtrip() {
        let data = Ipv6Packet::build(
            addr("fc00::1"),
            addr("fc00::2"),
            PROTO_ICMPV6,
            255,
            &[1, 2, 3],
        );
        let pkt = Ipv6Packet::parse(&data).unwrap();
        assert_eq!(pkt.src_ip, addr("fc00::1"));
        assert_eq!(pkt.dst_ip, addr("fc00::2"));
        assert_eq!(pkt.next_header, PROTO_ICMPV6);
        assert_eq!(pkt.hop_limit, 255);
        assert_eq!(pkt.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_neighbor_advert_parses_back() {
        let mac: MacAddress = "0e:00:00:00:00:01".parse().unwrap();
        let icmp = build_neighbor_advert(&addr("fc00::fe"), &addr("fc00::2"), &addr("fc00::fe"), mac);
        match Icmpv6Message::parse(&icmp).unwrap() {
            Icmpv6Message::NeighborAdvert {
                target,
                target_link_addr,
            } => {
                assert_eq!(target, addr("fc00::fe"));
                assert_eq!(target_link_addr, Some(mac));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_advert_checksum_verifies() {
        let mac: MacAddress = "0e:00:00:00:00:01".parse().unwrap();
        let src = addr("fc00::fe");
        let dst = addr("fc00::2");
        let icmp = build_neighbor_advert(&src, &dst, &src, mac);
        // Re-summing a message including its checksum yields zero.
        assert_eq!(icmpv6_checksum(&src, &dst, &icmp), 0);
    }

    #[test]
    fn test_parse_solicit_with_option() {
        let mac: MacAddress = "02:00:00:00:00:09".parse().unwrap();
        let icmp = build_neighbor_solicit(&addr("fc00::2"), &addr("fc00::fe"), &addr("fc00::fe"), mac);
        match Icmpv6Message::parse(&icmp).unwrap() {
            Icmpv6Message::NeighborSolicit {
                target,
                source_link_addr,
            } => {
                assert_eq!(target, addr("fc00::fe"));
                assert_eq!(source_link_addr, Some(mac));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_unhandled_type_is_other() {
        let msg = Icmpv6Message::parse(&[130, 0, 0, 0]).unwrap();
        assert_eq!(msg, Icmpv6Message::Other(130));
    }
}
