//! Packet-in metadata.

use faucet_packet::ethernet::EthernetFrame;
use faucet_packet::{MacAddress, PacketError};

/// A received packet-in: the raw frame plus the decode the valve dispatches
/// on. Control-plane handlers re-decode the raw bytes with their own header
/// budget via [`PacketMeta::reparse_ip`].
#[derive(Debug, Clone)]
pub struct PacketMeta {
    /// Raw frame as received, possibly miss-length truncated.
    pub data: Vec<u8>,
    pub frame: EthernetFrame,
    pub port_num: u32,
    /// VID from the frame's 802.1Q tag; untagged frames carry none.
    pub vlan_vid: Option<u16>,
    pub eth_src: MacAddress,
    pub eth_dst: MacAddress,
}

impl PacketMeta {
    /// Decode a packet-in payload received on `port_num`.
    pub fn parse(data: &[u8], port_num: u32) -> Result<Self, PacketError> {
        let frame = EthernetFrame::parse(data, 0)?;
        Ok(Self {
            data: data.to_vec(),
            eth_src: frame.eth_src,
            eth_dst: frame.eth_dst,
            vlan_vid: frame.vlan_vid,
            port_num,
            frame,
        })
    }

    /// Re-decode with a payload budget of `max_len` bytes (zero: no limit).
    pub fn reparse(&mut self, max_len: usize) {
        if let Ok(frame) = EthernetFrame::parse(&self.data, max_len) {
            self.frame = frame;
        }
    }

    /// Re-decode keeping one IP header for `eth_type` plus `payload` bytes,
    /// enough for a control-plane handler to see its nested message.
    pub fn reparse_ip(&mut self, eth_type: u16, payload: usize) {
        let budget = EthernetFrame::header_budget(eth_type);
        if budget == 0 {
            self.reparse(0);
        } else {
            self.reparse(budget + payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faucet_packet::ethernet::{ETH_TYPE_IPV4, ETH_TYPE_IPV6};

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_tagged_frame() {
        let data = EthernetFrame::build(
            mac("ff:ff:ff:ff:ff:ff"),
            mac("02:00:00:00:00:01"),
            Some(10),
            ETH_TYPE_IPV4,
            &[0u8; 40],
        );
        let meta = PacketMeta::parse(&data, 1).unwrap();
        assert_eq!(meta.vlan_vid, Some(10));
        assert_eq!(meta.port_num, 1);
        assert_eq!(meta.eth_src, mac("02:00:00:00:00:01"));
    }

    #[test]
    fn test_reparse_ip_budget() {
        let data = EthernetFrame::build(
            mac("02:00:00:00:00:02"),
            mac("02:00:00:00:00:01"),
            None,
            ETH_TYPE_IPV6,
            &[0u8; 200],
        );
        let mut meta = PacketMeta::parse(&data, 1).unwrap();
        meta.reparse_ip(ETH_TYPE_IPV6, 8);
        assert_eq!(meta.frame.payload.len(), 40 + 8);
        meta.reparse(0);
        assert_eq!(meta.frame.payload.len(), 200);
    }
}
