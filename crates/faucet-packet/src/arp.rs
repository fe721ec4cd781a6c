//! ARP request/reply codec (RFC 826, Ethernet/IPv4 only).

use std::net::Ipv4Addr;

use crate::mac::MacAddress;
use crate::{PacketError, Result};

const ARP_LEN: usize = 28;
const HTYPE_ETHERNET: u16 = 1;

pub const OP_REQUEST: u16 = 1;
pub const OP_REPLY: u16 = 2;

/// A decoded ARP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub opcode: u16,
    pub sender_mac: MacAddress,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddress,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn is_request(&self) -> bool {
        self.opcode == OP_REQUEST
    }

    pub fn is_reply(&self) -> bool {
        self.opcode == OP_REPLY
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < ARP_LEN {
            return Err(PacketError::Truncated {
                needed: ARP_LEN,
                have: payload.len(),
            });
        }
        let htype = u16::from_be_bytes([payload[0], payload[1]]);
        let ptype = u16::from_be_bytes([payload[2], payload[3]]);
        if htype != HTYPE_ETHERNET || ptype != crate::ethernet::ETH_TYPE_IPV4 {
            return Err(PacketError::InvalidField {
                field: "arp htype/ptype",
                value: format!("{}/{:#06x}", htype, ptype),
            });
        }
        Ok(Self {
            opcode: u16::from_be_bytes([payload[6], payload[7]]),
            sender_mac: MacAddress::new(payload[8..14].try_into().expect("length checked")),
            sender_ip: Ipv4Addr::new(payload[14], payload[15], payload[16], payload[17]),
            target_mac: MacAddress::new(payload[18..24].try_into().expect("length checked")),
            target_ip: Ipv4Addr::new(payload[24], payload[25], payload[26], payload[27]),
        })
    }

    pub fn build(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(ARP_LEN);
        data.extend_from_slice(&HTYPE_ETHERNET.to_be_bytes());
        data.extend_from_slice(&crate::ethernet::ETH_TYPE_IPV4.to_be_bytes());
        data.push(6); // hlen
        data.push(4); // plen
        data.extend_from_slice(&self.opcode.to_be_bytes());
        data.extend_from_slice(self.sender_mac.as_bytes());
        data.extend_from_slice(&self.sender_ip.octets());
        data.extend_from_slice(self.target_mac.as_bytes());
        data.extend_from_slice(&self.target_ip.octets());
        data
    }

    /// Reply to this packet from `our_mac`/`our_ip`, addressed to the sender.
    pub fn reply_from(&self, our_mac: MacAddress, our_ip: Ipv4Addr) -> ArpPacket {
        ArpPacket {
            opcode: OP_REPLY,
            sender_mac: our_mac,
            sender_ip: our_ip,
            target_mac: self.sender_mac,
            target_ip: self.sender_ip,
        }
    }
}
