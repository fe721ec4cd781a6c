//! OXM match sets.

use std::net::{Ipv4Addr, Ipv6Addr};

use faucet_packet::MacAddress;

use crate::{OFPVID_NONE, OFPVID_PRESENT};

/// OXM match field kinds, used to declare a table's restricted match set
/// and to validate advertised table features against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchField {
    InPort,
    EthSrc,
    EthDst,
    EthType,
    VlanVid,
    IpProto,
    Ipv4Src,
    Ipv4Dst,
    Ipv6Src,
    Ipv6Dst,
    Icmpv6Type,
    Ipv6NdTarget,
    TcpSrc,
    TcpDst,
    UdpSrc,
    UdpDst,
}

impl MatchField {
    /// The OXM field name, as it appears in pipeline files.
    pub fn name(&self) -> &'static str {
        match self {
            MatchField::InPort => "in_port",
            MatchField::EthSrc => "eth_src",
            MatchField::EthDst => "eth_dst",
            MatchField::EthType => "eth_type",
            MatchField::VlanVid => "vlan_vid",
            MatchField::IpProto => "ip_proto",
            MatchField::Ipv4Src => "ipv4_src",
            MatchField::Ipv4Dst => "ipv4_dst",
            MatchField::Ipv6Src => "ipv6_src",
            MatchField::Ipv6Dst => "ipv6_dst",
            MatchField::Icmpv6Type => "icmpv6_type",
            MatchField::Ipv6NdTarget => "ipv6_nd_target",
            MatchField::TcpSrc => "tcp_src",
            MatchField::TcpDst => "tcp_dst",
            MatchField::UdpSrc => "udp_src",
            MatchField::UdpDst => "udp_dst",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "in_port" => Some(MatchField::InPort),
            "eth_src" => Some(MatchField::EthSrc),
            "eth_dst" => Some(MatchField::EthDst),
            "eth_type" => Some(MatchField::EthType),
            "vlan_vid" => Some(MatchField::VlanVid),
            "ip_proto" => Some(MatchField::IpProto),
            "ipv4_src" => Some(MatchField::Ipv4Src),
            "ipv4_dst" => Some(MatchField::Ipv4Dst),
            "ipv6_src" => Some(MatchField::Ipv6Src),
            "ipv6_dst" => Some(MatchField::Ipv6Dst),
            "icmpv6_type" => Some(MatchField::Icmpv6Type),
            "ipv6_nd_target" => Some(MatchField::Ipv6NdTarget),
            "tcp_src" => Some(MatchField::TcpSrc),
            "tcp_dst" => Some(MatchField::TcpDst),
            "udp_src" => Some(MatchField::UdpSrc),
            "udp_dst" => Some(MatchField::UdpDst),
            _ => None,
        }
    }
}

/// A VLAN VID match value with the presence bit made explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VlanVid {
    /// Match untagged frames only.
    Absent,
    /// Match frames tagged with this VID.
    Present(u16),
}

impl VlanVid {
    /// Wire encoding: `OFPVID_NONE` or `vid | OFPVID_PRESENT`.
    pub fn to_wire(self) -> u16 {
        match self {
            VlanVid::Absent => OFPVID_NONE,
            VlanVid::Present(vid) => vid | OFPVID_PRESENT,
        }
    }

    pub fn from_wire(raw: u16) -> Self {
        if raw & OFPVID_PRESENT == 0 {
            VlanVid::Absent
        } else {
            VlanVid::Present(raw & !OFPVID_PRESENT)
        }
    }

    /// The VID if a tag is present.
    pub fn vid(self) -> Option<u16> {
        match self {
            VlanVid::Absent => None,
            VlanVid::Present(vid) => Some(vid),
        }
    }
}

/// An OXM match set; unset fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Match {
    pub in_port: Option<u32>,
    pub vlan_vid: Option<VlanVid>,
    pub eth_src: Option<MacAddress>,
    pub eth_dst: Option<MacAddress>,
    pub eth_type: Option<u16>,
    pub ip_proto: Option<u8>,
    pub ipv4_src: Option<(Ipv4Addr, u8)>,
    pub ipv4_dst: Option<(Ipv4Addr, u8)>,
    pub ipv6_src: Option<(Ipv6Addr, u8)>,
    pub ipv6_dst: Option<(Ipv6Addr, u8)>,
    pub icmpv6_type: Option<u8>,
    pub ipv6_nd_target: Option<Ipv6Addr>,
    pub tcp_src: Option<u16>,
    pub tcp_dst: Option<u16>,
    pub udp_src: Option<u16>,
    pub udp_dst: Option<u16>,
}

impl Match {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_port(mut self, port: u32) -> Self {
        self.in_port = Some(port);
        self
    }

    pub fn vlan(mut self, vid: VlanVid) -> Self {
        self.vlan_vid = Some(vid);
        self
    }

    /// Match frames tagged with `vid`.
    pub fn vlan_vid(self, vid: u16) -> Self {
        self.vlan(VlanVid::Present(vid))
    }

    pub fn eth_src(mut self, mac: MacAddress) -> Self {
        self.eth_src = Some(mac);
        self
    }

    pub fn eth_dst(mut self, mac: MacAddress) -> Self {
        self.eth_dst = Some(mac);
        self
    }

    pub fn eth_type(mut self, eth_type: u16) -> Self {
        self.eth_type = Some(eth_type);
        self
    }

    pub fn ip_proto(mut self, proto: u8) -> Self {
        self.ip_proto = Some(proto);
        self
    }

    pub fn ipv4_dst(mut self, addr: Ipv4Addr, prefix_len: u8) -> Self {
        self.ipv4_dst = Some((addr, prefix_len));
        self
    }

    pub fn ipv6_dst(mut self, addr: Ipv6Addr, prefix_len: u8) -> Self {
        self.ipv6_dst = Some((addr, prefix_len));
        self
    }

    pub fn icmpv6_type(mut self, icmp_type: u8) -> Self {
        self.icmpv6_type = Some(icmp_type);
        self
    }

    pub fn ipv6_nd_target(mut self, target: Ipv6Addr) -> Self {
        self.ipv6_nd_target = Some(target);
        self
    }

    /// True when every field is a wildcard.
    pub fn is_wildcard(&self) -> bool {
        *self == Self::default()
    }

    /// Fields set on this match, for restricted-match validation.
    pub fn fields(&self) -> Vec<MatchField> {
        let mut fields = Vec::new();
        if self.in_port.is_some() {
            fields.push(MatchField::InPort);
        }
        if self.vlan_vid.is_some() {
            fields.push(MatchField::VlanVid);
        }
        if self.eth_src.is_some() {
            fields.push(MatchField::EthSrc);
        }
        if self.eth_dst.is_some() {
            fields.push(MatchField::EthDst);
        }
        if self.eth_type.is_some() {
            fields.push(MatchField::EthType);
        }
        if self.ip_proto.is_some() {
            fields.push(MatchField::IpProto);
        }
        if self.ipv4_src.is_some() {
            fields.push(MatchField::Ipv4Src);
        }
        if self.ipv4_dst.is_some() {
            fields.push(MatchField::Ipv4Dst);
        }
        if self.ipv6_src.is_some() {
            fields.push(MatchField::Ipv6Src);
        }
        if self.ipv6_dst.is_some() {
            fields.push(MatchField::Ipv6Dst);
        }
        if self.icmpv6_type.is_some() {
            fields.push(MatchField::Icmpv6Type);
        }
        if self.ipv6_nd_target.is_some() {
            fields.push(MatchField::Ipv6NdTarget);
        }
        if self.tcp_src.is_some() {
            fields.push(MatchField::TcpSrc);
        }
        if self.tcp_dst.is_some() {
            fields.push(MatchField::TcpDst);
        }
        if self.udp_src.is_some() {
            fields.push(MatchField::UdpSrc);
        }
        if self.udp_dst.is_some() {
            fields.push(MatchField::UdpDst);
        }
        fields
    }
}
