//! FIB, VIP and neighbor programming, one manager per IP version.
//!
//! A route manager owns no cache of its own: routes and neighbor state live
//! on each VLAN so they survive a reload of an unchanged VLAN. The manager
//! is only the policy: which punts, rewrites and packet-outs a VLAN's L3
//! configuration translates to.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv6Addr};

use tracing::{debug, info, warn};

use faucet_config::{Dp, IpNet, IpVersion, NeighborEntry, Port, Priorities, Vlan};
use faucet_of::actions::{apply_actions, goto_table, Action, SetField};
use faucet_of::{FlowTable, Match, OfMsg, PacketOut};
use faucet_packet::arp::{self, ArpPacket};
use faucet_packet::ethernet::{EthernetFrame, ETH_TYPE_ARP, ETH_TYPE_IPV4, ETH_TYPE_IPV6};
use faucet_packet::icmpv6::{
    self, Icmpv6Message, Ipv6Packet, ND_NEIGHBOR_SOLICIT, ND_ROUTER_SOLICIT, PROTO_ICMPV6,
};
use faucet_packet::ipv4::{IcmpEcho, Ipv4Packet, ICMP_ECHO_REQUEST, PROTO_ICMP};
use faucet_packet::{mac, MacAddress};

use crate::meta::PacketMeta;

/// Routed-prefix priority climbs with prefix length so the longest prefix
/// wins; the VIP punt sits above any host route.
fn route_priority(priorities: &Priorities, prefix_len: u8) -> u16 {
    priorities.low + 1 + u16::from(prefix_len)
}

fn vip_priority(priorities: &Priorities) -> u16 {
    priorities.low + 131
}

/// Manages one IP version's tables for a datapath.
pub struct RouteManager {
    ipv: IpVersion,
    fib_table: FlowTable,
    vip_table: FlowTable,
    eth_src_table: FlowTable,
    eth_dst_table: FlowTable,
    priorities: Priorities,
    dec_ttl: bool,
    proactive_learn: bool,
    neighbor_timeout: u64,
    max_hosts_per_resolve_cycle: usize,
    max_host_fib_retry_count: u8,
    max_resolve_backoff_time: u64,
}

impl RouteManager {
    pub fn new(dp: &Dp, ipv: IpVersion, dec_ttl: bool) -> Self {
        let fib_table = match ipv {
            IpVersion::V4 => dp.tables.ipv4_fib.clone(),
            IpVersion::V6 => dp.tables.ipv6_fib.clone(),
        };
        Self {
            ipv,
            fib_table,
            vip_table: dp.tables.vip.clone(),
            eth_src_table: dp.tables.eth_src.clone(),
            eth_dst_table: dp.tables.eth_dst.clone(),
            priorities: dp.priorities,
            dec_ttl,
            proactive_learn: dp.proactive_learn,
            neighbor_timeout: dp.arp_neighbor_timeout,
            max_hosts_per_resolve_cycle: dp.max_hosts_per_resolve_cycle,
            max_host_fib_retry_count: dp.max_host_fib_retry_count,
            max_resolve_backoff_time: dp.max_resolve_backoff_time,
        }
    }

    pub fn ipv(&self) -> IpVersion {
        self.ipv
    }

    fn eth_type(&self) -> u16 {
        match self.ipv {
            IpVersion::V4 => ETH_TYPE_IPV4,
            IpVersion::V6 => ETH_TYPE_IPV6,
        }
    }

    fn fib_dst_match(&self, vlan: &Vlan, net: IpNet) -> Match {
        let m = Match::new()
            .vlan_vid(vlan.vid)
            .eth_type(self.eth_type());
        match (self.ipv, net.ip) {
            (IpVersion::V4, IpAddr::V4(ip)) => m.ipv4_dst(ip, net.prefix_len),
            (IpVersion::V6, IpAddr::V6(ip)) => m.ipv6_dst(ip, net.prefix_len),
            _ => m,
        }
    }

    /// Provision one controller-owned gateway address on `vlan`.
    pub fn add_faucet_vip(&self, vlan: &Vlan, vip: IpNet) -> Vec<OfMsg> {
        let mut ofmsgs = Vec::new();
        let host_net = IpNet::host(vip.ip);

        // Punt resolution traffic, which still floods so hosts resolve
        // each other directly.
        match self.ipv {
            IpVersion::V4 => {
                ofmsgs.push(
                    self.eth_src_table
                        .flowcontroller(
                            Match::new().vlan_vid(vlan.vid).eth_type(ETH_TYPE_ARP),
                            self.priorities.high,
                            vec![goto_table(&self.eth_dst_table)],
                        )
                        .into(),
                );
            }
            IpVersion::V6 => {
                ofmsgs.push(
                    self.eth_src_table
                        .flowcontroller(
                            Match::new()
                                .vlan_vid(vlan.vid)
                                .eth_type(ETH_TYPE_IPV6)
                                .ip_proto(PROTO_ICMPV6)
                                .icmpv6_type(ND_NEIGHBOR_SOLICIT),
                            self.priorities.high,
                            vec![goto_table(&self.eth_dst_table)],
                        )
                        .into(),
                );
                ofmsgs.push(
                    self.eth_src_table
                        .flowcontroller(
                            Match::new()
                                .vlan_vid(vlan.vid)
                                .eth_type(ETH_TYPE_IPV6)
                                .ip_proto(PROTO_ICMPV6)
                                .icmpv6_type(ND_ROUTER_SOLICIT),
                            self.priorities.high,
                            Vec::new(),
                        )
                        .into(),
                );
            }
        }

        // Frames addressed to the controller MAC route through the FIB.
        ofmsgs.push(
            self.eth_src_table
                .flowmod(
                    Match::new()
                        .vlan_vid(vlan.vid)
                        .eth_dst(vlan.faucet_mac)
                        .eth_type(self.eth_type()),
                    self.priorities.high,
                    vec![goto_table(&self.fib_table)],
                )
                .into(),
        );

        // The VIP itself punts to the controller via the vip table.
        ofmsgs.push(
            self.fib_table
                .flowmod(
                    self.fib_dst_match(vlan, host_net),
                    vip_priority(&self.priorities),
                    vec![goto_table(&self.vip_table)],
                )
                .into(),
        );
        ofmsgs.push(
            self.vip_table
                .flowcontroller(
                    self.fib_dst_match(vlan, host_net),
                    self.priorities.high,
                    Vec::new(),
                )
                .into(),
        );

        // Direct-connected subnet: punt misses so gateways resolve without
        // data-plane loss.
        if self.proactive_learn {
            ofmsgs.push(
                self.fib_table
                    .flowcontroller(
                        self.fib_dst_match(vlan, vip),
                        self.priorities.low,
                        Vec::new(),
                    )
                    .into(),
            );
        }

        info!(vlan = vlan.vid, "configured VIP {}", vip);
        ofmsgs
    }

    /// A resolved route: rewrite MACs toward the next hop and hand the
    /// frame back to L2 forwarding.
    fn route_flow(&self, vlan: &Vlan, dst: IpNet, nexthop_mac: MacAddress) -> OfMsg {
        let mut actions = vec![
            Action::SetField(SetField::EthSrc(vlan.faucet_mac)),
            Action::SetField(SetField::EthDst(nexthop_mac)),
        ];
        if self.dec_ttl {
            actions.push(Action::DecNwTtl);
        }
        self.fib_table
            .flowmod(
                self.fib_dst_match(vlan, dst),
                route_priority(&self.priorities, dst.prefix_len),
                vec![apply_actions(actions), goto_table(&self.eth_dst_table)],
            )
            .into()
    }

    /// Record a resolved neighbor and program every route through it.
    fn update_nexthop(
        &self,
        vlan: &mut Vlan,
        ip: IpAddr,
        nexthop_mac: MacAddress,
        now: u64,
    ) -> Vec<OfMsg> {
        vlan.neigh_cache.insert(
            ip,
            NeighborEntry {
                mac: Some(nexthop_mac),
                cache_time: now,
                resolve_retries: 0,
                next_resolve_sec: 0,
            },
        );
        let routed: Vec<IpNet> = vlan
            .routes
            .iter()
            .filter(|(dst, gw)| dst.version() == self.ipv && **gw == ip)
            .map(|(dst, _)| *dst)
            .collect();
        let mut ofmsgs = Vec::new();
        for dst in &routed {
            ofmsgs.push(self.route_flow(vlan, *dst, nexthop_mac));
        }
        // The neighbor itself is reachable directly.
        if vlan.vip_containing(&ip).is_some() {
            ofmsgs.push(self.route_flow(vlan, IpNet::host(ip), nexthop_mac));
        }
        debug!(
            vlan = vlan.vid,
            routes = routed.len(),
            "resolved {} to {}",
            ip,
            nexthop_mac
        );
        ofmsgs
    }

    /// Add a route; the FIB programs immediately when the gateway is
    /// already resolved, otherwise on resolution.
    pub fn add_route(&self, vlan: &mut Vlan, ip_gw: IpAddr, ip_dst: IpNet) -> Vec<OfMsg> {
        vlan.routes.insert(ip_dst, ip_gw);
        match vlan.neigh_cache.get(&ip_gw).and_then(|entry| entry.mac) {
            Some(nexthop_mac) => vec![self.route_flow(vlan, ip_dst, nexthop_mac)],
            None => {
                vlan.neigh_cache
                    .entry(ip_gw)
                    .or_insert_with(|| NeighborEntry::unresolved(0));
                Vec::new()
            }
        }
    }

    pub fn del_route(&self, vlan: &mut Vlan, ip_dst: IpNet) -> Vec<OfMsg> {
        if vlan.routes.remove(&ip_dst).is_none() {
            return Vec::new();
        }
        vec![self.fib_table.flowdel(self.fib_dst_match(vlan, ip_dst)).into()]
    }

    /// Learn a directly-connected host's address from any of its frames and
    /// install its host route.
    pub fn add_host_fib_route_from_pkt(
        &self,
        vlan: &mut Vlan,
        pkt_meta: &mut PacketMeta,
        now: u64,
    ) -> Vec<OfMsg> {
        pkt_meta.reparse_ip(self.eth_type(), 0);
        let src_ip = match (self.ipv, pkt_meta.frame.eth_type) {
            (IpVersion::V4, ETH_TYPE_IPV4) => Ipv4Packet::parse(&pkt_meta.frame.payload)
                .ok()
                .map(|pkt| IpAddr::V4(pkt.src_ip)),
            (IpVersion::V6, ETH_TYPE_IPV6) => Ipv6Packet::parse(&pkt_meta.frame.payload)
                .ok()
                .map(|pkt| IpAddr::V6(pkt.src_ip)),
            _ => None,
        };
        let Some(src_ip) = src_ip else {
            return Vec::new();
        };
        if vlan.vip_containing(&src_ip).is_none() || vlan.is_faucet_vip(&src_ip) {
            return Vec::new();
        }
        vlan.routes.insert(IpNet::host(src_ip), src_ip);
        self.update_nexthop(vlan, src_ip, pkt_meta.eth_src, now)
    }

    /// Whether a frame on `vlan` should be offered to this manager.
    fn handles_eth_type(&self, eth_type: u16) -> bool {
        match self.ipv {
            IpVersion::V4 => eth_type == ETH_TYPE_ARP || eth_type == ETH_TYPE_IPV4,
            IpVersion::V6 => eth_type == ETH_TYPE_IPV6,
        }
    }

    /// Reply frame toward `port`, tagged only when the port runs tagged.
    fn reply_out(
        vlan: &Vlan,
        port: &Port,
        eth_dst: MacAddress,
        eth_type: u16,
        payload: &[u8],
    ) -> OfMsg {
        let tag = vlan.tagged.contains(&port.number).then_some(vlan.vid);
        let frame = EthernetFrame::build(eth_dst, vlan.faucet_mac, tag, eth_type, payload);
        PacketOut::to_port(port.number, frame).into()
    }

    /// Decode and answer control-plane traffic: gateway resolution and
    /// echo addressed to a VIP. Empty when the packet is not for this
    /// manager.
    pub fn control_plane_handler(
        &self,
        port: &Port,
        vlan: &mut Vlan,
        pkt_meta: &mut PacketMeta,
        now: u64,
    ) -> Vec<OfMsg> {
        if !self.handles_eth_type(pkt_meta.frame.eth_type) {
            return Vec::new();
        }
        pkt_meta.reparse_ip(pkt_meta.frame.eth_type, 96);
        match self.ipv {
            IpVersion::V4 => self.control_plane_v4(port, vlan, pkt_meta, now),
            IpVersion::V6 => self.control_plane_v6(port, vlan, pkt_meta, now),
        }
    }

    fn control_plane_v4(
        &self,
        port: &Port,
        vlan: &mut Vlan,
        pkt_meta: &mut PacketMeta,
        now: u64,
    ) -> Vec<OfMsg> {
        let mut ofmsgs = Vec::new();
        if pkt_meta.frame.eth_type == ETH_TYPE_ARP {
            pkt_meta.reparse(0);
            let Ok(arp_pkt) = ArpPacket::parse(&pkt_meta.frame.payload) else {
                return ofmsgs;
            };
            let target = IpAddr::V4(arp_pkt.target_ip);
            let sender = IpAddr::V4(arp_pkt.sender_ip);
            if arp_pkt.is_request() && vlan.is_faucet_vip(&target) {
                let reply = arp_pkt.reply_from(vlan.faucet_mac, arp_pkt.target_ip);
                ofmsgs.push(Self::reply_out(
                    vlan,
                    port,
                    arp_pkt.sender_mac,
                    ETH_TYPE_ARP,
                    &reply.build(),
                ));
                ofmsgs.extend(self.update_nexthop(vlan, sender, arp_pkt.sender_mac, now));
                info!(
                    vlan = vlan.vid,
                    port = port.number,
                    "responded to ARP request for {} from {}",
                    arp_pkt.target_ip,
                    arp_pkt.sender_ip
                );
            } else if arp_pkt.is_reply() && pkt_meta.eth_dst == vlan.faucet_mac {
                ofmsgs.extend(self.update_nexthop(vlan, sender, arp_pkt.sender_mac, now));
                info!(vlan = vlan.vid, "ARP response {} for {}", arp_pkt.sender_mac, sender);
            }
            return ofmsgs;
        }

        let Ok(ip_pkt) = Ipv4Packet::parse(&pkt_meta.frame.payload) else {
            return ofmsgs;
        };
        let dst = IpAddr::V4(ip_pkt.dst_ip);
        if ip_pkt.proto == PROTO_ICMP && vlan.is_faucet_vip(&dst) {
            if let Ok(echo) = IcmpEcho::parse(&ip_pkt.payload) {
                if echo.icmp_type == ICMP_ECHO_REQUEST {
                    let reply =
                        Ipv4Packet::build(ip_pkt.dst_ip, ip_pkt.src_ip, PROTO_ICMP, &echo.reply().build());
                    ofmsgs.push(Self::reply_out(
                        vlan,
                        port,
                        pkt_meta.eth_src,
                        ETH_TYPE_IPV4,
                        &reply,
                    ));
                }
            }
        }
        ofmsgs
    }

    fn control_plane_v6(
        &self,
        port: &Port,
        vlan: &mut Vlan,
        pkt_meta: &mut PacketMeta,
        now: u64,
    ) -> Vec<OfMsg> {
        let mut ofmsgs = Vec::new();
        let Ok(ip_pkt) = Ipv6Packet::parse(&pkt_meta.frame.payload) else {
            return ofmsgs;
        };
        if ip_pkt.next_header != PROTO_ICMPV6 {
            return ofmsgs;
        }
        let Ok(msg) = Icmpv6Message::parse(&ip_pkt.payload) else {
            return ofmsgs;
        };
        let src = IpAddr::V6(ip_pkt.src_ip);
        match msg {
            Icmpv6Message::NeighborSolicit {
                target,
                source_link_addr,
            } if vlan.is_faucet_vip(&IpAddr::V6(target)) => {
                let advert = icmpv6::build_neighbor_advert(
                    &target,
                    &ip_pkt.src_ip,
                    &target,
                    vlan.faucet_mac,
                );
                let ip_reply =
                    Ipv6Packet::build(target, ip_pkt.src_ip, PROTO_ICMPV6, 255, &advert);
                ofmsgs.push(Self::reply_out(
                    vlan,
                    port,
                    pkt_meta.eth_src,
                    ETH_TYPE_IPV6,
                    &ip_reply,
                ));
                let neighbor_mac = source_link_addr.unwrap_or(pkt_meta.eth_src);
                ofmsgs.extend(self.update_nexthop(vlan, src, neighbor_mac, now));
                info!(
                    vlan = vlan.vid,
                    port = port.number,
                    "responded to ND solicit for {} from {}",
                    target,
                    ip_pkt.src_ip
                );
            }
            Icmpv6Message::NeighborAdvert {
                target,
                target_link_addr,
            } if pkt_meta.eth_dst == vlan.faucet_mac => {
                let neighbor_mac = target_link_addr.unwrap_or(pkt_meta.eth_src);
                ofmsgs.extend(self.update_nexthop(vlan, IpAddr::V6(target), neighbor_mac, now));
                info!(vlan = vlan.vid, "ND advert {} for {}", neighbor_mac, target);
            }
            Icmpv6Message::RouterSolicit => {
                ofmsgs.extend(self.router_advert_out(vlan, port, pkt_meta.eth_src, ip_pkt.src_ip));
            }
            Icmpv6Message::EchoRequest { rest }
                if vlan.is_faucet_vip(&IpAddr::V6(ip_pkt.dst_ip)) =>
            {
                let reply = icmpv6::build_echo_reply(&ip_pkt.dst_ip, &ip_pkt.src_ip, &rest);
                let ip_reply =
                    Ipv6Packet::build(ip_pkt.dst_ip, ip_pkt.src_ip, PROTO_ICMPV6, 64, &reply);
                ofmsgs.push(Self::reply_out(
                    vlan,
                    port,
                    pkt_meta.eth_src,
                    ETH_TYPE_IPV6,
                    &ip_reply,
                ));
            }
            _ => {}
        }
        ofmsgs
    }

    fn router_advert_out(
        &self,
        vlan: &Vlan,
        port: &Port,
        eth_dst: MacAddress,
        ip_dst: Ipv6Addr,
    ) -> Vec<OfMsg> {
        let mut ofmsgs = Vec::new();
        for vip in vlan.faucet_vips_by_version(IpVersion::V6) {
            let IpAddr::V6(vip_ip) = vip.ip else { continue };
            let ra = icmpv6::build_router_advert(
                &vip_ip,
                &ip_dst,
                vlan.faucet_mac,
                &vip_ip,
                vip.prefix_len,
                1800,
            );
            let ip_reply = Ipv6Packet::build(vip_ip, ip_dst, PROTO_ICMPV6, 255, &ra);
            ofmsgs.push(Self::reply_out(vlan, port, eth_dst, ETH_TYPE_IPV6, &ip_reply));
        }
        ofmsgs
    }

    fn solicit_out(
        &self,
        ports: &BTreeMap<u32, Port>,
        vlan: &Vlan,
        gw: IpAddr,
    ) -> Vec<OfMsg> {
        let Some(vip) = vlan.vip_containing(&gw) else {
            return Vec::new();
        };
        let mut ofmsgs = Vec::new();
        for port_num in vlan.port_nums() {
            let Some(port) = ports.get(&port_num) else {
                continue;
            };
            if !port.running() || port.stack.is_some() {
                continue;
            }
            match (gw, vip.ip) {
                (IpAddr::V4(gw4), IpAddr::V4(vip4)) => {
                    let request = ArpPacket {
                        opcode: arp::OP_REQUEST,
                        sender_mac: vlan.faucet_mac,
                        sender_ip: vip4,
                        target_mac: MacAddress::new([0; 6]),
                        target_ip: gw4,
                    };
                    ofmsgs.push(Self::reply_out(
                        vlan,
                        port,
                        mac::BROADCAST,
                        ETH_TYPE_ARP,
                        &request.build(),
                    ));
                }
                (IpAddr::V6(gw6), IpAddr::V6(vip6)) => {
                    let octets = gw6.octets();
                    let suffix = [octets[13], octets[14], octets[15]];
                    let snm_ip = Ipv6Addr::from([
                        0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0xff, suffix[0], suffix[1],
                        suffix[2],
                    ]);
                    let solicit =
                        icmpv6::build_neighbor_solicit(&vip6, &snm_ip, &gw6, vlan.faucet_mac);
                    let ip_pkt = Ipv6Packet::build(vip6, snm_ip, PROTO_ICMPV6, 255, &solicit);
                    ofmsgs.push(Self::reply_out(
                        vlan,
                        port,
                        MacAddress::solicited_node(suffix),
                        ETH_TYPE_IPV6,
                        &ip_pkt,
                    ));
                }
                _ => {}
            }
        }
        ofmsgs
    }

    /// Solicit unresolved and stale gateways, with exponential backoff per
    /// gateway and a per-cycle budget.
    pub fn resolve_gateways(
        &self,
        ports: &BTreeMap<u32, Port>,
        vlan: &mut Vlan,
        now: u64,
    ) -> Vec<OfMsg> {
        let mut ofmsgs = Vec::new();
        let gateways: BTreeSet<IpAddr> = vlan
            .routes
            .iter()
            .filter(|(dst, _)| dst.version() == self.ipv)
            .map(|(_, gw)| *gw)
            .chain(
                vlan.neigh_cache
                    .iter()
                    .filter(|(ip, _)| IpVersion::of(ip) == self.ipv)
                    .map(|(ip, _)| *ip),
            )
            .collect();
        let mut resolves = 0;
        for gw in gateways {
            if resolves >= self.max_hosts_per_resolve_cycle {
                break;
            }
            let entry = vlan
                .neigh_cache
                .entry(gw)
                .or_insert_with(|| NeighborEntry::unresolved(now));
            let fresh = entry.resolved()
                && now.saturating_sub(entry.cache_time) < self.neighbor_timeout;
            if fresh || entry.next_resolve_sec > now {
                continue;
            }
            if entry.resolve_retries >= self.max_host_fib_retry_count {
                warn!(
                    vlan = vlan.vid,
                    retries = entry.resolve_retries,
                    "expiring unresolvable gateway {}",
                    gw
                );
                vlan.neigh_cache.remove(&gw);
                let dead_hosts: Vec<IpNet> = vlan
                    .routes
                    .iter()
                    .filter(|(dst, route_gw)| dst.is_host() && **route_gw == gw)
                    .map(|(dst, _)| *dst)
                    .collect();
                for dst in dead_hosts {
                    ofmsgs.extend(self.del_route(vlan, dst));
                }
                continue;
            }
            entry.resolve_retries += 1;
            let backoff = 1u64
                .checked_shl(u32::from(entry.resolve_retries))
                .unwrap_or(self.max_resolve_backoff_time)
                .min(self.max_resolve_backoff_time);
            entry.next_resolve_sec = now + backoff;
            debug!(
                vlan = vlan.vid,
                retry = entry.resolve_retries,
                "resolving gateway {}",
                gw
            );
            ofmsgs.extend(self.solicit_out(ports, vlan, gw));
            resolves += 1;
        }
        ofmsgs
    }

    /// Periodic service advertisement (IPv6 router advertisements).
    pub fn advertise(&self, ports: &BTreeMap<u32, Port>, vlan: &Vlan) -> Vec<OfMsg> {
        if self.ipv != IpVersion::V6 {
            return Vec::new();
        }
        let all_nodes = Ipv6Addr::from([0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        let all_nodes_mac = MacAddress::new([0x33, 0x33, 0, 0, 0, 1]);
        let mut ofmsgs = Vec::new();
        for port_num in vlan.port_nums() {
            let Some(port) = ports.get(&port_num) else {
                continue;
            };
            if !port.running() || port.stack.is_some() {
                continue;
            }
            ofmsgs.extend(self.router_advert_out(vlan, port, all_nodes_mac, all_nodes));
        }
        ofmsgs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faucet_config::Vlan;
    use faucet_of::messages::OfMsg;
    use faucet_of::Instruction;

    fn v4_dp() -> Dp {
        let mut dp = Dp::new(1, "dp1", "Open vSwitch");
        dp.proactive_learn = true;
        dp.add_vlan(
            Vlan::new(10).with_faucet_vip(IpNet::new("10.0.0.254".parse().unwrap(), 24)),
        )
        .unwrap();
        dp.add_port(faucet_config::Port::new(1).with_native_vlan(10))
            .unwrap();
        dp.add_port(faucet_config::Port::new(2).with_native_vlan(10))
            .unwrap();
        for port in dp.ports.values_mut() {
            port.phys_up = true;
        }
        dp
    }

    fn mgr(dp: &Dp, ipv: IpVersion) -> RouteManager {
        RouteManager::new(dp, ipv, true)
    }

    fn mac_of(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    fn arp_request_meta(sender_ip: &str, target_ip: &str, sender_mac: &str) -> PacketMeta {
        let request = ArpPacket {
            opcode: arp::OP_REQUEST,
            sender_mac: mac_of(sender_mac),
            sender_ip: sender_ip.parse().unwrap(),
            target_mac: MacAddress::new([0; 6]),
            target_ip: target_ip.parse().unwrap(),
        };
        let frame = EthernetFrame::build(
            mac::BROADCAST,
            mac_of(sender_mac),
            Some(10),
            ETH_TYPE_ARP,
            &request.build(),
        );
        PacketMeta::parse(&frame, 1).unwrap()
    }

    #[test]
    fn test_add_faucet_vip_punts_and_routes() {
        let dp = v4_dp();
        let manager = mgr(&dp, IpVersion::V4);
        let vlan = dp.vlans[&10].clone();
        let msgs = manager.add_faucet_vip(&vlan, vlan.faucet_vips[0]);

        // ARP punt, FIB goto, VIP goto, VIP punt, proactive subnet punt.
        assert_eq!(msgs.len(), 5);
        let fib_rules: Vec<_> = msgs
            .iter()
            .filter_map(OfMsg::as_flowmod)
            .filter(|fm| fm.table_id == dp.tables.ipv4_fib.table_id)
            .collect();
        assert_eq!(fib_rules.len(), 2);
        // The /32 VIP punt outranks the /24 subnet punt.
        assert!(fib_rules[0].priority > fib_rules[1].priority);
    }

    #[test]
    fn test_arp_request_for_vip_replies_and_learns() {
        let dp = v4_dp();
        let manager = mgr(&dp, IpVersion::V4);
        let mut vlan = dp.vlans[&10].clone();
        let port = dp.ports[&1].clone();
        let mut meta = arp_request_meta("10.0.0.2", "10.0.0.254", "02:00:00:00:00:02");

        let msgs = manager.control_plane_handler(&port, &mut vlan, &mut meta, 100);
        assert!(!msgs.is_empty());
        match &msgs[0] {
            OfMsg::PacketOut(po) => {
                let frame = EthernetFrame::parse(&po.data, 0).unwrap();
                assert_eq!(frame.eth_type, ETH_TYPE_ARP);
                let reply = ArpPacket::parse(&frame.payload).unwrap();
                assert!(reply.is_reply());
                assert_eq!(reply.sender_mac, vlan.faucet_mac);
                assert_eq!(reply.target_ip, "10.0.0.2".parse::<std::net::Ipv4Addr>().unwrap());
            }
            other => panic!("unexpected message {:?}", other),
        }
        let cached = &vlan.neigh_cache[&"10.0.0.2".parse::<IpAddr>().unwrap()];
        assert_eq!(cached.mac, Some(mac_of("02:00:00:00:00:02")));
        // The sender got a direct host route.
        assert!(msgs.iter().any(|msg| msg
            .as_flowmod()
            .is_some_and(|fm| fm.table_id == dp.tables.ipv4_fib.table_id)));
    }

    #[test]
    fn test_arp_for_other_host_not_handled() {
        let dp = v4_dp();
        let manager = mgr(&dp, IpVersion::V4);
        let mut vlan = dp.vlans[&10].clone();
        let port = dp.ports[&1].clone();
        let mut meta = arp_request_meta("10.0.0.2", "10.0.0.3", "02:00:00:00:00:02");
        assert!(manager
            .control_plane_handler(&port, &mut vlan, &mut meta, 100)
            .is_empty());
    }

    #[test]
    fn test_add_route_waits_for_resolution() {
        let dp = v4_dp();
        let manager = mgr(&dp, IpVersion::V4);
        let mut vlan = dp.vlans[&10].clone();
        let gw: IpAddr = "10.0.0.2".parse().unwrap();
        let dst = IpNet::new("192.0.2.0".parse().unwrap(), 24);

        // Unresolved gateway: route recorded, nothing programmed yet.
        assert!(manager.add_route(&mut vlan, gw, dst).is_empty());
        assert_eq!(vlan.routes[&dst], gw);

        // Resolution programs the pending route and the gateway host route.
        let msgs = manager.update_nexthop(&mut vlan, gw, mac_of("02:00:00:00:00:02"), 100);
        assert_eq!(msgs.len(), 2);
        let fm = msgs[0].as_flowmod().unwrap();
        assert!(fm
            .instructions
            .iter()
            .any(|inst| matches!(inst, Instruction::GotoTable(id) if *id == dp.tables.eth_dst.table_id)));

        // A later add through the resolved gateway programs immediately.
        let dst2 = IpNet::new("198.51.100.0".parse().unwrap(), 24);
        assert_eq!(manager.add_route(&mut vlan, gw, dst2).len(), 1);

        // Removal retires the flow.
        let msgs = manager.del_route(&mut vlan, dst);
        assert!(msgs[0].as_flowmod().unwrap().is_delete());
        assert!(manager.del_route(&mut vlan, dst).is_empty());
    }

    #[test]
    fn test_resolve_gateways_backoff_and_budget() {
        let mut dp = v4_dp();
        dp.max_hosts_per_resolve_cycle = 1;
        let manager = mgr(&dp, IpVersion::V4);
        let mut vlan = dp.vlans[&10].clone();
        manager.add_route(
            &mut vlan,
            "10.0.0.2".parse().unwrap(),
            IpNet::new("192.0.2.0".parse().unwrap(), 24),
        );
        manager.add_route(
            &mut vlan,
            "10.0.0.3".parse().unwrap(),
            IpNet::new("198.51.100.0".parse().unwrap(), 24),
        );

        // Budget of one: only the first gateway is solicited, on both ports.
        let msgs = manager.resolve_gateways(&dp.ports, &mut vlan, 100);
        assert_eq!(msgs.len(), 2);

        // Backoff: an immediate second cycle solicits the second gateway
        // only, the first is waiting out its backoff.
        let msgs = manager.resolve_gateways(&dp.ports, &mut vlan, 100);
        assert_eq!(msgs.len(), 2);
        let msgs = manager.resolve_gateways(&dp.ports, &mut vlan, 100);
        assert!(msgs.is_empty());
    }

    #[test]
    fn test_resolve_gateways_gives_up_after_retries() {
        let mut dp = v4_dp();
        dp.max_host_fib_retry_count = 2;
        let manager = mgr(&dp, IpVersion::V4);
        let mut vlan = dp.vlans[&10].clone();
        let host: IpAddr = "10.0.0.9".parse().unwrap();
        vlan.routes.insert(IpNet::host(host), host);

        let mut now = 100;
        for _ in 0..2 {
            assert!(!manager.resolve_gateways(&dp.ports, &mut vlan, now).is_empty());
            now += 100;
        }
        // Retries exhausted: host route withdrawn, cache entry dropped.
        let msgs = manager.resolve_gateways(&dp.ports, &mut vlan, now);
        assert!(msgs.iter().any(|m| m.as_flowmod().is_some_and(|fm| fm.is_delete())));
        assert!(vlan.routes.is_empty());
        assert!(vlan.neigh_cache.is_empty());
    }

    fn v6_dp() -> Dp {
        let mut dp = Dp::new(1, "dp1", "Open vSwitch");
        dp.add_vlan(Vlan::new(10).with_faucet_vip(IpNet::new("fc00::fe".parse().unwrap(), 64)))
            .unwrap();
        dp.add_port(faucet_config::Port::new(1).with_native_vlan(10))
            .unwrap();
        for port in dp.ports.values_mut() {
            port.phys_up = true;
        }
        dp
    }

    #[test]
    fn test_nd_solicit_for_vip_gets_advert() {
        let dp = v6_dp();
        let manager = mgr(&dp, IpVersion::V6);
        let mut vlan = dp.vlans[&10].clone();
        let port = dp.ports[&1].clone();

        let solicit = icmpv6::build_neighbor_solicit(
            &"fc00::2".parse().unwrap(),
            &"fc00::fe".parse().unwrap(),
            &"fc00::fe".parse().unwrap(),
            mac_of("02:00:00:00:00:02"),
        );
        let ip_pkt = Ipv6Packet::build(
            "fc00::2".parse().unwrap(),
            "fc00::fe".parse().unwrap(),
            PROTO_ICMPV6,
            255,
            &solicit,
        );
        let frame = EthernetFrame::build(
            vlan.faucet_mac,
            mac_of("02:00:00:00:00:02"),
            Some(10),
            ETH_TYPE_IPV6,
            &ip_pkt,
        );
        let mut meta = PacketMeta::parse(&frame, 1).unwrap();

        let msgs = manager.control_plane_handler(&port, &mut vlan, &mut meta, 100);
        assert!(!msgs.is_empty());
        match &msgs[0] {
            OfMsg::PacketOut(po) => {
                let frame = EthernetFrame::parse(&po.data, 0).unwrap();
                assert_eq!(frame.eth_type, ETH_TYPE_IPV6);
                let reply = Ipv6Packet::parse(&frame.payload).unwrap();
                match Icmpv6Message::parse(&reply.payload).unwrap() {
                    Icmpv6Message::NeighborAdvert { target, .. } => {
                        assert_eq!(target, "fc00::fe".parse::<Ipv6Addr>().unwrap());
                    }
                    other => panic!("unexpected reply {:?}", other),
                }
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert!(vlan
            .neigh_cache
            .contains_key(&"fc00::2".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn test_advertise_emits_ra_per_port() {
        let dp = v6_dp();
        let manager = mgr(&dp, IpVersion::V6);
        let msgs = manager.advertise(&dp.ports, &dp.vlans[&10]);
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            OfMsg::PacketOut(po) => {
                let frame = EthernetFrame::parse(&po.data, 0).unwrap();
                let ip_pkt = Ipv6Packet::parse(&frame.payload).unwrap();
                assert_eq!(ip_pkt.payload[0], icmpv6::ND_ROUTER_ADVERT);
            }
            other => panic!("unexpected message {:?}", other),
        }

        // The v4 manager never advertises.
        let v4 = mgr(&dp, IpVersion::V4);
        assert!(v4.advertise(&dp.ports, &dp.vlans[&10]).is_empty());
    }
}
