//! Ethernet II framing with optional 802.1Q tags.

use crate::mac::MacAddress;
use crate::{PacketError, Result};

pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;
pub const ETH_TYPE_VLAN: u16 = 0x8100;
pub const ETH_TYPE_IPV6: u16 = 0x86dd;
pub const ETH_TYPE_LLDP: u16 = 0x88cc;

const ETH_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;

/// A decoded Ethernet frame header and its payload.
///
/// Only the outermost 802.1Q tag is decoded; the valve pipeline never sees
/// QinQ frames (the vlan table matches a single tag).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrame {
    pub eth_dst: MacAddress,
    pub eth_src: MacAddress,
    /// VID from an 802.1Q tag, if tagged.
    pub vlan_vid: Option<u16>,
    pub eth_type: u16,
    pub payload: Vec<u8>,
}

impl EthernetFrame {
    /// Decode a frame, reading at most `max_len` payload bytes when nonzero.
    ///
    /// Packet-in events often carry a miss-length-truncated copy of the
    /// frame; callers that only need L2/L3 headers pass a budget so a
    /// truncated payload is not an error.
    pub fn parse(data: &[u8], max_len: usize) -> Result<Self> {
        if data.len() < ETH_HEADER_LEN {
            return Err(PacketError::Truncated {
                needed: ETH_HEADER_LEN,
                have: data.len(),
            });
        }
        let eth_dst = MacAddress::new(data[0..6].try_into().expect("slice length checked"));
        let eth_src = MacAddress::new(data[6..12].try_into().expect("slice length checked"));
        let mut eth_type = u16::from_be_bytes([data[12], data[13]]);
        let mut offset = ETH_HEADER_LEN;
        let mut vlan_vid = None;
        if eth_type == ETH_TYPE_VLAN {
            if data.len() < ETH_HEADER_LEN + VLAN_TAG_LEN {
                return Err(PacketError::Truncated {
                    needed: ETH_HEADER_LEN + VLAN_TAG_LEN,
                    have: data.len(),
                });
            }
            let tci = u16::from_be_bytes([data[14], data[15]]);
            vlan_vid = Some(tci & 0x0fff);
            eth_type = u16::from_be_bytes([data[16], data[17]]);
            offset += VLAN_TAG_LEN;
        }
        let mut payload = &data[offset..];
        if max_len > 0 && payload.len() > max_len {
            payload = &payload[..max_len];
        }
        Ok(Self {
            eth_dst,
            eth_src,
            vlan_vid,
            eth_type,
            payload: payload.to_vec(),
        })
    }

    /// Encode a frame, inserting an 802.1Q tag when `vlan_vid` is set.
    pub fn build(
        eth_dst: MacAddress,
        eth_src: MacAddress,
        vlan_vid: Option<u16>,
        eth_type: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut data = Vec::with_capacity(ETH_HEADER_LEN + VLAN_TAG_LEN + payload.len());
        data.extend_from_slice(eth_dst.as_bytes());
        data.extend_from_slice(eth_src.as_bytes());
        if let Some(vid) = vlan_vid {
            data.extend_from_slice(&ETH_TYPE_VLAN.to_be_bytes());
            data.extend_from_slice(&(vid & 0x0fff).to_be_bytes());
        }
        data.extend_from_slice(&eth_type.to_be_bytes());
        data.extend_from_slice(payload);
        data
    }

    /// Header length for a given ethertype, used to size reparse budgets.
    pub fn header_budget(eth_type: u16) -> usize {
        match eth_type {
            ETH_TYPE_IPV4 => crate::ipv4::IPV4_HEADER_LEN,
            ETH_TYPE_IPV6 => crate::icmpv6::IPV6_HEADER_LEN,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_untagged_roundtrip() {
        let data = EthernetFrame::build(
            mac("ff:ff:ff:ff:ff:ff"),
            mac("02:00:00:00:00:01"),
            None,
            ETH_TYPE_ARP,
            &[1, 2, 3],
        );
        let frame = EthernetFrame::parse(&data, 0).unwrap();
        assert_eq!(frame.eth_src, mac("02:00:00:00:00:01"));
        assert_eq!(frame.vlan_vid, None);
        assert_eq!(frame.eth_type, ETH_TYPE_ARP);
        assert_eq!(frame.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_tagged_roundtrip() {
        let data = EthernetFrame::build(
            mac("02:00:00:00:00:02"),
            mac("02:00:00:00:00:01"),
            Some(100),
            ETH_TYPE_IPV4,
            &[0u8; 20],
        );
        let frame = EthernetFrame::parse(&data, 0).unwrap();
        assert_eq!(frame.vlan_vid, Some(100));
        assert_eq!(frame.eth_type, ETH_TYPE_IPV4);
    }

    #[test]
    fn test_payload_budget() {
        let data = EthernetFrame::build(
            mac("02:00:00:00:00:02"),
            mac("02:00:00:00:00:01"),
            None,
            ETH_TYPE_IPV4,
            &[7u8; 64],
        );
        let frame = EthernetFrame::parse(&data, 8).unwrap();
        assert_eq!(frame.payload.len(), 8);
    }

    #[test]
    fn test_truncated_header() {
        let err = EthernetFrame::parse(&[0u8; 10], 0).unwrap_err();
        assert_eq!(
            err,
            PacketError::Truncated {
                needed: 14,
                have: 10
            }
        );
    }
}
