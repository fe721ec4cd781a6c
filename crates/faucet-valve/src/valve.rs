//! The valve: one datapath's event-to-messages state machine.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use faucet_config::{Dp, IpNet, IpVersion, Vlan};
use faucet_of::actions::{apply_actions, goto_table, output_port, push_vlan_act, Instruction};
use faucet_of::messages::{controller_pps_meteradd, controller_pps_meterdel, meteradd, meterdel};
use faucet_of::{groups, ignore_port, FlowTable, Match, OfMsg, VlanVid};
use faucet_packet::{mac, MacAddress};

use crate::acl::build_acl_entry;
use crate::flood::FloodManager;
use crate::host::HostManager;
use crate::meta::PacketMeta;
use crate::metrics::FaucetMetrics;
use crate::oflog::OfChannelLog;
use crate::route::RouteManager;
use crate::tfm::{self, SwitchVariant};
use crate::{Result, ValveError};

/// Port status change reported by the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStatusReason {
    Add,
    Delete,
    Modify,
}

/// Reload diff over the incoming datapath descriptor.
#[derive(Debug, Default)]
struct ConfigChanges {
    deleted_ports: BTreeSet<u32>,
    changed_ports: BTreeSet<u32>,
    changed_acl_ports: BTreeSet<u32>,
    deleted_vlans: BTreeSet<u16>,
    changed_vlans: BTreeSet<u16>,
    all_ports_changed: bool,
}

/// Build a valve matching the datapath's hardware model, or `None` for
/// unsupported hardware (the caller decides what that means).
pub fn valve_factory(dp: Dp) -> Option<Valve> {
    SwitchVariant::from_hardware(&dp.hardware).map(|variant| Valve::with_variant(dp, variant))
}

/// Generates the messages configuring one datapath as an L2/L3 learning
/// switch. Vendor differences live in the [`SwitchVariant`]; everything
/// else is common.
pub struct Valve {
    dp: Dp,
    variant: SwitchVariant,
    log_id: String,
    l3: bool,
    route_managers: Vec<RouteManager>,
    host_manager: HostManager,
    flood_manager: FloodManager,
    ofchannel: Option<OfChannelLog>,
    packet_in_count_sec: u64,
    last_packet_in_sec: u64,
    last_advertise_sec: u64,
    exported_mac_labels: Vec<[String; 4]>,
}

impl Valve {
    pub fn new(dp: Dp) -> Self {
        Self::with_variant(dp, SwitchVariant::Standard)
    }

    pub fn with_variant(dp: Dp, variant: SwitchVariant) -> Self {
        let host_manager = HostManager::new(&dp);
        let flood_manager = FloodManager::new(&dp);
        let route_managers = vec![
            RouteManager::new(&dp, IpVersion::V4, variant.dec_ttl()),
            RouteManager::new(&dp, IpVersion::V6, variant.dec_ttl()),
        ];
        let ofchannel = dp.ofchannel_log.clone().map(OfChannelLog::new);
        let log_id = format!("{:#x}", dp.dp_id);
        Self {
            dp,
            variant,
            log_id,
            l3: false,
            route_managers,
            host_manager,
            flood_manager,
            ofchannel,
            packet_in_count_sec: 0,
            last_packet_in_sec: 0,
            last_advertise_sec: 0,
            exported_mac_labels: Vec::new(),
        }
    }

    pub fn dp(&self) -> &Dp {
        &self.dp
    }

    /// Managers capture table handles and policy knobs from the descriptor;
    /// a descriptor swap rebuilds them.
    fn rebuild_managers(&mut self) {
        self.host_manager = HostManager::new(&self.dp);
        self.flood_manager = FloodManager::new(&self.dp);
        self.route_managers = vec![
            RouteManager::new(&self.dp, IpVersion::V4, self.variant.dec_ttl()),
            RouteManager::new(&self.dp, IpVersion::V6, self.variant.dec_ttl()),
        ];
        self.log_id = format!("{:#x}", self.dp.dp_id);
        self.ofchannel = self.dp.ofchannel_log.clone().map(OfChannelLog::new);
    }

    /// Vendor-specific configuration on switch feature negotiation. The
    /// base pipeline needs none; table-features variants declare theirs.
    pub fn switch_features(&self, dp_id: u64) -> Vec<OfMsg> {
        if self.ignore_dpid(dp_id) {
            return Vec::new();
        }
        let Some(conf) = self.variant.pipeline_conf() else {
            return Vec::new();
        };
        let path = self.dp.pipeline_config_dir.join(conf);
        info!(dp_id = %self.log_id, "loading pipeline configuration");
        match tfm::load_pipeline(&path) {
            Ok(tables) => {
                let mut ofmsgs = self.delete_all_valve_flows();
                tfm::verify_pipeline_config(&self.dp, &tables);
                ofmsgs.push(faucet_of::messages::table_features(tables));
                ofmsgs
            }
            Err(err) => {
                error!(dp_id = %self.log_id, "cannot load pipeline {}: {}", path.display(), err);
                Vec::new()
            }
        }
    }

    /// Mirror emitted messages into the OF-channel debug log, if enabled.
    pub fn ofchannel_log(&self, ofmsgs: &[OfMsg]) {
        if let Some(log) = &self.ofchannel {
            log.log(self.dp.dp_id, ofmsgs);
        }
    }

    fn ignore_dpid(&self, dp_id: u64) -> bool {
        if dp_id != self.dp.dp_id {
            error!(dp_id = %self.log_id, "unknown datapath {:#x}", dp_id);
            return true;
        }
        false
    }

    fn delete_all_valve_flows(&self) -> Vec<OfMsg> {
        let mut ofmsgs: Vec<OfMsg> = vec![FlowTable::wildcard().flowdel(Match::new()).into()];
        if !self.dp.meters.is_empty() {
            ofmsgs.push(meterdel());
        }
        if self.dp.group_table {
            ofmsgs.push(groups::delete_all());
        }
        ofmsgs
    }

    fn delete_all_port_match_flows(&self, port_num: u32) -> Vec<OfMsg> {
        self.dp
            .tables
            .in_port_tables()
            .iter()
            .map(|table| table.flowdel(Match::new().in_port(port_num)).into())
            .collect()
    }

    fn add_default_drop_flows(&self) -> Vec<OfMsg> {
        let vlan_table = &self.dp.tables.vlan;
        let priorities = &self.dp.priorities;
        let mut ofmsgs: Vec<OfMsg> = self
            .dp
            .tables
            .all()
            .iter()
            .map(|table| table.flowdrop(Match::new(), priorities.lowest).into())
            .collect();

        if self.dp.drop_broadcast_source_address {
            ofmsgs.push(
                vlan_table
                    .flowdrop(Match::new().eth_src(mac::BROADCAST), priorities.highest)
                    .into(),
            );
        }
        if self.dp.drop_spoofed_faucet_mac {
            for vlan in self.dp.vlans.values() {
                ofmsgs.push(
                    vlan_table
                        .flowdrop(Match::new().eth_src(vlan.faucet_mac), priorities.high)
                        .into(),
                );
            }
        }
        if self.dp.drop_bpdu {
            for bpdu_mac in [mac::BPDU_BRIDGE_GROUP, mac::BPDU_CISCO_PVST] {
                ofmsgs.push(
                    vlan_table
                        .flowdrop(Match::new().eth_dst(bpdu_mac), priorities.highest)
                        .into(),
                );
            }
        }
        if self.dp.drop_lldp {
            ofmsgs.push(
                vlan_table
                    .flowdrop(
                        Match::new().eth_type(faucet_packet::ETH_TYPE_LLDP),
                        priorities.highest,
                    )
                    .into(),
            );
        }
        ofmsgs
    }

    /// Unknown destinations fall through to flooding.
    fn add_vlan_flood_flow(&self) -> OfMsg {
        self.dp
            .tables
            .eth_dst
            .flowmod(
                Match::new(),
                self.dp.priorities.low,
                vec![goto_table(&self.dp.tables.flood)],
            )
            .into()
    }

    /// Unknown sources punt to the controller for learning.
    fn add_controller_learn_flow(&self) -> OfMsg {
        self.dp
            .tables
            .eth_src
            .flowcontroller(
                Match::new(),
                self.dp.priorities.low,
                vec![goto_table(&self.dp.tables.eth_dst)],
            )
            .into()
    }

    fn add_packetin_meter(&self) -> Vec<OfMsg> {
        match self.dp.packetin_pps {
            Some(pps) => vec![controller_pps_meterdel(), controller_pps_meteradd(pps)],
            None => Vec::new(),
        }
    }

    fn add_default_flows(&self) -> Vec<OfMsg> {
        let mut ofmsgs = self.delete_all_valve_flows();
        ofmsgs.extend(self.add_packetin_meter());
        for meter in self.dp.meters.values() {
            ofmsgs.push(meteradd(meter.meter_id, meter.rate_pps));
        }
        ofmsgs.extend(self.add_default_drop_flows());
        ofmsgs.push(self.add_vlan_flood_flow());
        ofmsgs
    }

    fn add_vlan_acl(&self, vid: u16) -> Vec<OfMsg> {
        let mut ofmsgs = Vec::new();
        let Some(acl_id) = self.dp.vlan_acl_in.get(&vid) else {
            return ofmsgs;
        };
        let Some(acl) = self.dp.acls.get(acl_id) else {
            return ofmsgs;
        };
        let allow_inst = goto_table(&self.dp.tables.eth_src);
        let mut acl_rule_priority = self.dp.priorities.highest;
        for rule in &acl.rules {
            let (acl_match, acl_inst, acl_ofmsgs) =
                build_acl_entry(rule, allow_inst.clone(), &self.dp.meters, None, Some(vid));
            ofmsgs.extend(acl_ofmsgs);
            ofmsgs.push(
                self.dp
                    .tables
                    .vlan_acl
                    .flowmod(acl_match, acl_rule_priority, acl_inst)
                    .into(),
            );
            acl_rule_priority -= 1;
        }
        ofmsgs
    }

    /// Configure one VLAN: flooding, its ACL, and its VIPs.
    fn add_vlan(&mut self, vid: u16) -> Result<Vec<OfMsg>> {
        let Some(vlan) = self.dp.vlans.get(&vid) else {
            return Ok(Vec::new());
        };
        info!(dp_id = %self.log_id, "configuring {}", vlan);
        let mut ofmsgs = self.flood_manager.build_flood_rules(&self.dp, vlan, false);
        ofmsgs.extend(self.add_vlan_acl(vid));
        let mut routing = false;
        for route_manager in &self.route_managers {
            for vip in vlan.faucet_vips_by_version(route_manager.ipv()) {
                if self.dp.stack.is_some() {
                    return Err(ValveError::StackingWithRouting {
                        dp_id: self.dp.dp_id,
                    });
                }
                ofmsgs.extend(route_manager.add_faucet_vip(vlan, vip));
                routing = true;
            }
        }
        if routing {
            self.l3 = true;
        }
        Ok(ofmsgs)
    }

    /// Remove a VLAN's flows from every table matching on its tag. The vlan
    /// table's own `(in_port, vid)` rules go with their ports.
    fn del_vlan(&self, vlan: &Vlan) -> Vec<OfMsg> {
        info!(dp_id = %self.log_id, "delete {}", vlan);
        self.dp
            .tables
            .vlan_match_tables()
            .iter()
            .map(|table| table.flowdel(Match::new().vlan_vid(vlan.vid)).into())
            .collect()
    }

    fn add_ports_and_vlans(&mut self, discovered_port_nums: &[u32]) -> Result<Vec<OfMsg>> {
        let mut ofmsgs = Vec::new();
        let mut all_port_nums: BTreeSet<u32> = BTreeSet::new();

        for port in self.dp.stack_ports() {
            all_port_nums.insert(port.number);
        }
        for port in self.dp.ports.values() {
            if port.mirror_destination {
                all_port_nums.insert(port.number);
            }
        }
        let vids: Vec<u16> = self.dp.vlans.keys().copied().collect();
        for vid in vids {
            if let Some(vlan) = self.dp.vlans.get(&vid) {
                all_port_nums.extend(vlan.port_nums());
            }
            ofmsgs.extend(self.add_vlan(vid)?);
        }
        for port_num in discovered_port_nums {
            if !ignore_port(*port_num) {
                all_port_nums.insert(*port_num);
            }
        }

        let all_port_nums: Vec<u32> = all_port_nums.into_iter().collect();
        ofmsgs.extend(self.ports_add(self.dp.dp_id, &all_port_nums, true));
        Ok(ofmsgs)
    }

    /// Cold start: delete everything, then provision the full pipeline.
    ///
    /// Only a configuration contradiction errors; every runtime fault
    /// degrades to a logged line.
    pub fn datapath_connect(
        &mut self,
        dp_id: u64,
        discovered_up_port_nums: &[u32],
    ) -> Result<Vec<OfMsg>> {
        if self.ignore_dpid(dp_id) {
            return Ok(Vec::new());
        }
        info!(dp_id = %self.log_id, "cold start configuring DP");
        // Ports report down asynchronously; assume configured ports are up
        // until the switch says otherwise.
        for port in self.dp.ports.values_mut() {
            port.phys_up = true;
        }
        let mut ofmsgs = self.add_default_flows();
        ofmsgs.extend(self.add_ports_and_vlans(discovered_up_port_nums)?);
        ofmsgs.push(self.add_controller_learn_flow());
        self.dp.running = true;
        Ok(ofmsgs)
    }

    /// The switch is gone; nothing to program, only state to flip.
    pub fn datapath_disconnect(&mut self, dp_id: u64) {
        if !self.ignore_dpid(dp_id) {
            self.dp.running = false;
            warn!(dp_id = %self.log_id, "datapath down");
        }
    }

    fn port_add_acl(&self, port_num: u32, cold_start: bool) -> Vec<OfMsg> {
        let port_acl_table = &self.dp.tables.port_acl;
        let in_port_match = Match::new().in_port(port_num);
        let mut ofmsgs = Vec::new();
        if cold_start {
            ofmsgs.push(port_acl_table.flowdel(in_port_match.clone()).into());
        }
        let allow_inst = goto_table(&self.dp.tables.vlan);
        match self
            .dp
            .port_acl_in
            .get(&port_num)
            .and_then(|acl_id| self.dp.acls.get(acl_id))
        {
            Some(acl) => {
                let mut acl_rule_priority = self.dp.priorities.highest;
                for rule in &acl.rules {
                    let (acl_match, acl_inst, acl_ofmsgs) = build_acl_entry(
                        rule,
                        allow_inst.clone(),
                        &self.dp.meters,
                        Some(port_num),
                        None,
                    );
                    ofmsgs.extend(acl_ofmsgs);
                    ofmsgs.push(
                        port_acl_table
                            .flowmod(acl_match, acl_rule_priority, acl_inst)
                            .into(),
                    );
                    acl_rule_priority -= 1;
                }
            }
            None => {
                ofmsgs.push(
                    port_acl_table
                        .flowmod(
                            in_port_match,
                            self.dp.priorities.highest,
                            vec![allow_inst],
                        )
                        .into(),
                );
            }
        }
        ofmsgs
    }

    fn port_add_vlan_rules(
        &self,
        port_num: u32,
        vlan_vid: VlanVid,
        vlan_inst: Vec<Instruction>,
    ) -> OfMsg {
        self.dp
            .tables
            .vlan
            .flowmod(
                Match::new().in_port(port_num).vlan(vlan_vid),
                self.dp.priorities.low,
                vlan_inst,
            )
            .into()
    }

    fn find_forwarding_table(&self, vlan: &Vlan) -> &FlowTable {
        if self.dp.vlan_acl_in.contains_key(&vlan.vid) {
            &self.dp.tables.vlan_acl
        } else {
            &self.dp.tables.eth_src
        }
    }

    fn port_add_vlans(
        &self,
        port_num: u32,
        mirror_act: &[faucet_of::Action],
        tagged_vlans: &[&Vlan],
        untagged_vlans: &[&Vlan],
    ) -> Vec<OfMsg> {
        let mut ofmsgs = Vec::new();
        for vlan in tagged_vlans {
            let mut inst = vec![goto_table(self.find_forwarding_table(vlan))];
            if !mirror_act.is_empty() {
                inst.insert(0, apply_actions(mirror_act.to_vec()));
            }
            ofmsgs.push(self.port_add_vlan_rules(port_num, VlanVid::Present(vlan.vid), inst));
        }
        for vlan in untagged_vlans {
            let mut push_vlan = mirror_act.to_vec();
            push_vlan.extend(push_vlan_act(vlan.vid));
            let inst = vec![
                apply_actions(push_vlan),
                goto_table(self.find_forwarding_table(vlan)),
            ];
            ofmsgs.push(self.port_add_vlan_rules(port_num, VlanVid::Absent, inst));
        }
        ofmsgs
    }

    fn port_delete_flows(&self, port_num: u32, old_eth_srcs: &[MacAddress]) -> Vec<OfMsg> {
        let mut ofmsgs = self.delete_all_port_match_flows(port_num);
        ofmsgs.push(self.dp.tables.eth_dst.flowdel_out_port(port_num).into());
        let permanent_learn = self
            .dp
            .ports
            .get(&port_num)
            .is_some_and(|port| port.permanent_learn);
        if permanent_learn {
            for eth_src in old_eth_srcs {
                ofmsgs.push(
                    self.dp
                        .tables
                        .eth_src
                        .flowdel(Match::new().eth_src(*eth_src))
                        .into(),
                );
            }
        }
        ofmsgs
    }

    fn eth_srcs_learned_on_port(&self, port_num: u32) -> Vec<MacAddress> {
        let Some(port) = self.dp.ports.get(&port_num) else {
            return Vec::new();
        };
        let mut eth_srcs = Vec::new();
        for vid in port.vlans() {
            if let Some(vlan) = self.dp.vlans.get(&vid) {
                eth_srcs.extend(HostManager::hosts_on_port(vlan, port_num));
            }
        }
        eth_srcs
    }

    /// Bring up and program a set of ports. During a cold start the flood
    /// rules were just built, so only warm adds rebuild them.
    pub fn ports_add(&mut self, dp_id: u64, port_nums: &[u32], cold_start: bool) -> Vec<OfMsg> {
        if self.ignore_dpid(dp_id) {
            return Vec::new();
        }

        let mut ofmsgs = Vec::new();
        let mut vlans_with_ports_added: BTreeSet<u16> = BTreeSet::new();

        for &port_num in port_nums {
            if ignore_port(port_num) {
                continue;
            }
            if !self.dp.ports.contains_key(&port_num) {
                info!(
                    dp_id = %self.log_id,
                    "ignoring port:{} not present in configuration file", port_num
                );
                continue;
            }
            if let Some(port) = self.dp.ports.get_mut(&port_num) {
                port.phys_up = true;
            }
            let Some(port) = self.dp.ports.get(&port_num).cloned() else {
                continue;
            };
            info!(dp_id = %self.log_id, "sending config for {}", port);
            if !port.running() {
                continue;
            }

            // Mirror destinations carry no traffic of their own.
            if port.mirror_destination {
                ofmsgs.push(
                    self.dp
                        .tables
                        .vlan
                        .flowdrop(
                            Match::new().in_port(port_num),
                            self.dp.priorities.highest,
                        )
                        .into(),
                );
                continue;
            }

            ofmsgs.extend(self.port_add_acl(port_num, false));

            if port.stack.is_some() {
                // Stack links carry every VLAN from peer datapaths.
                ofmsgs.push(
                    self.dp
                        .tables
                        .vlan
                        .flowmod(
                            Match::new().in_port(port_num),
                            self.dp.priorities.low,
                            vec![goto_table(&self.dp.tables.eth_src)],
                        )
                        .into(),
                );
                vlans_with_ports_added.extend(self.dp.vlans.keys().copied());
            } else {
                let mirror_act: Vec<faucet_of::Action> =
                    port.mirror.map(output_port).into_iter().collect();
                let tagged: Vec<&Vlan> = port
                    .tagged_vlans
                    .iter()
                    .filter_map(|vid| self.dp.vlans.get(vid))
                    .collect();
                let untagged: Vec<&Vlan> = port
                    .native_vlan
                    .and_then(|vid| self.dp.vlans.get(&vid))
                    .into_iter()
                    .collect();
                ofmsgs.extend(self.port_add_vlans(port_num, &mirror_act, &tagged, &untagged));
                vlans_with_ports_added.extend(port.vlans());
            }
        }

        if !cold_start {
            for vid in vlans_with_ports_added {
                if let Some(vlan) = self.dp.vlans.get(&vid) {
                    ofmsgs.extend(self.flood_manager.build_flood_rules(&self.dp, vlan, false));
                }
            }
        }
        ofmsgs
    }

    pub fn port_add(&mut self, dp_id: u64, port_num: u32) -> Vec<OfMsg> {
        self.ports_add(dp_id, &[port_num], false)
    }

    /// Take ports down: wipe their ingress flows, their learned
    /// destinations, and rebuild flooding without them.
    pub fn ports_delete(&mut self, dp_id: u64, port_nums: &[u32]) -> Vec<OfMsg> {
        if self.ignore_dpid(dp_id) {
            return Vec::new();
        }

        let mut ofmsgs = Vec::new();
        let mut vlans_with_deleted_ports: BTreeSet<u16> = BTreeSet::new();

        for &port_num in port_nums {
            if ignore_port(port_num) || !self.dp.ports.contains_key(&port_num) {
                continue;
            }
            let old_eth_srcs = self.eth_srcs_learned_on_port(port_num);
            let Some(port) = self.dp.ports.get_mut(&port_num) else {
                continue;
            };
            port.phys_up = false;
            let port_vlans = port.vlans();
            info!(dp_id = %self.log_id, "{} down", port);
            ofmsgs.extend(self.port_delete_flows(port_num, &old_eth_srcs));
            vlans_with_deleted_ports.extend(port_vlans);
        }

        for vid in vlans_with_deleted_ports {
            if let Some(vlan) = self.dp.vlans.get(&vid) {
                ofmsgs.extend(self.flood_manager.build_flood_rules(&self.dp, vlan, true));
            }
        }
        ofmsgs
    }

    pub fn port_delete(&mut self, dp_id: u64, port_num: u32) -> Vec<OfMsg> {
        self.ports_delete(dp_id, &[port_num])
    }

    /// Dispatch a port status event. MODIFY is a delete then a conditional
    /// re-add so a flapping port always reprograms from clean state.
    pub fn port_status_handler(
        &mut self,
        dp_id: u64,
        port_no: u32,
        reason: PortStatusReason,
        port_is_up: bool,
    ) -> Vec<OfMsg> {
        match reason {
            PortStatusReason::Add => self.port_add(dp_id, port_no),
            PortStatusReason::Delete => self.port_delete(dp_id, port_no),
            PortStatusReason::Modify => {
                let mut ofmsgs = self.port_delete(dp_id, port_no);
                if port_is_up {
                    ofmsgs.extend(self.port_add(dp_id, port_no));
                }
                ofmsgs
            }
        }
    }

    /// True when this second's packet-in budget is spent.
    fn rate_limit_packet_ins(&mut self, now: u64) -> bool {
        if self.last_packet_in_sec != now {
            self.last_packet_in_sec = now;
            self.packet_in_count_sec = 0;
        }
        self.packet_in_count_sec += 1;
        self.dp.ignore_learn_ins > 0 && self.packet_in_count_sec % self.dp.ignore_learn_ins == 0
    }

    fn port_learn_ban_rules(&mut self, pkt_meta: &PacketMeta) -> Vec<OfMsg> {
        let port_num = pkt_meta.port_num;
        let Some(port) = self.dp.ports.get(&port_num) else {
            return Vec::new();
        };
        let Some(max_hosts) = port.max_hosts else {
            return Vec::new();
        };
        if self.eth_srcs_learned_on_port(port_num).len() < max_hosts {
            return Vec::new();
        }
        let Some(port) = self.dp.ports.get(&port_num).cloned() else {
            return Vec::new();
        };
        let ban = self.host_manager.temp_ban_host_learning_on_port(&port);
        if let Some(port) = self.dp.ports.get_mut(&port_num) {
            port.learn_ban_count += 1;
        }
        info!(
            dp_id = %self.log_id,
            "max hosts {} reached on port {}, temporarily banning learning \
             on this port, and not learning {}",
            max_hosts, port_num, pkt_meta.eth_src
        );
        vec![ban]
    }

    fn vlan_learn_ban_rules(&mut self, vid: u16, pkt_meta: &PacketMeta) -> Vec<OfMsg> {
        let Some(vlan) = self.dp.vlans.get(&vid) else {
            return Vec::new();
        };
        let Some(max_hosts) = vlan.max_hosts else {
            return Vec::new();
        };
        let hosts_count = self.host_manager.hosts_learned_on_vlan_count(vlan);
        if hosts_count < max_hosts || vlan.host_cache.contains_key(&pkt_meta.eth_src) {
            return Vec::new();
        }
        let ban = self.host_manager.temp_ban_host_learning_on_vlan(vlan);
        if let Some(vlan) = self.dp.vlans.get_mut(&vid) {
            vlan.learn_ban_count += 1;
        }
        info!(
            dp_id = %self.log_id,
            "max hosts {} reached on vlan {}, temporarily banning learning \
             on this vlan, and not learning {}",
            max_hosts, vid, pkt_meta.eth_src
        );
        vec![ban]
    }

    /// Find the edge datapath that already knows this host, for learning
    /// across a stack.
    fn edge_dp_for_host(&self, other_valves: &[&Valve], vid: u16, eth_src: MacAddress) -> Option<String> {
        for other_valve in other_valves {
            if other_valve.dp.dp_id == self.dp.dp_id {
                continue;
            }
            if let Some(other_vlan) = other_valve.dp.vlans.get(&vid) {
                if let Some(entry) = other_vlan.host_cache.get(&eth_src) {
                    if entry.edge {
                        return Some(other_valve.dp.name.clone());
                    }
                }
            }
        }
        None
    }

    fn learn_host(
        &mut self,
        other_valves: &[&Valve],
        vid: u16,
        pkt_meta: &PacketMeta,
        now: u64,
    ) -> Vec<OfMsg> {
        let mut learn_port_num = pkt_meta.port_num;
        let on_stack_port = self
            .dp
            .ports
            .get(&learn_port_num)
            .is_some_and(|port| port.stack.is_some());
        if on_stack_port {
            // Learn through the shortest path to the datapath the host is
            // physically attached to; if no edge knows it yet, it will be
            // learned there first and reflooded.
            let Some(edge_dp_name) = self.edge_dp_for_host(other_valves, vid, pkt_meta.eth_src)
            else {
                return Vec::new();
            };
            let Some(stack_port_num) = self.dp.shortest_path_port(&edge_dp_name) else {
                return Vec::new();
            };
            learn_port_num = stack_port_num;
            info!(dp_id = %self.log_id, "host learned via stack port to {}", edge_dp_name);
        }
        let Some(port) = self.dp.ports.get(&learn_port_num).cloned() else {
            return Vec::new();
        };
        let Some(vlan) = self.dp.vlans.get_mut(&vid) else {
            return Vec::new();
        };
        self.host_manager
            .learn_host_on_vlan_port(&port, vlan, pkt_meta.eth_src, now)
    }

    /// Handle a packet-in: control plane first, then rate limiting, caps,
    /// and finally learning. `other_valves` are the remaining datapaths in
    /// a stack, for edge discovery.
    pub fn rcv_packet(
        &mut self,
        dp_id: u64,
        other_valves: &[&Valve],
        mut pkt_meta: PacketMeta,
        now: u64,
    ) -> Vec<OfMsg> {
        if self.ignore_dpid(dp_id)
            || ignore_port(pkt_meta.port_num)
            || !self.dp.running
            || !self.dp.ports.contains_key(&pkt_meta.port_num)
        {
            return Vec::new();
        }
        let vid = match pkt_meta.vlan_vid {
            Some(vid) if self.dp.vlans.contains_key(&vid) => vid,
            other => {
                warn!(dp_id = %self.log_id, "packet-in for unexpected VLAN {:?}", other);
                return Vec::new();
            }
        };

        let mut ofmsgs = Vec::new();
        let mut control_plane_handled = false;

        if pkt_meta.eth_src.is_unicast() {
            debug!(
                dp_id = %self.log_id,
                "packet-in src:{} in_port:{} vid:{}",
                pkt_meta.eth_src, pkt_meta.port_num, vid
            );
            let faucet_mac = self.dp.vlans[&vid].faucet_mac;
            if self.l3 && (pkt_meta.eth_dst == faucet_mac || !pkt_meta.eth_dst.is_unicast()) {
                let port = self.dp.ports[&pkt_meta.port_num].clone();
                let Some(vlan) = self.dp.vlans.get_mut(&vid) else {
                    return ofmsgs;
                };
                for route_manager in &self.route_managers {
                    let control_plane_ofmsgs =
                        route_manager.control_plane_handler(&port, vlan, &mut pkt_meta, now);
                    if !control_plane_ofmsgs.is_empty() {
                        control_plane_handled = true;
                        ofmsgs.extend(control_plane_ofmsgs);
                        break;
                    }
                }
            }
        }

        if self.rate_limit_packet_ins(now) {
            return ofmsgs;
        }

        let ban_port_rules = self.port_learn_ban_rules(&pkt_meta);
        if !ban_port_rules.is_empty() {
            ofmsgs.extend(ban_port_rules);
            return ofmsgs;
        }

        let ban_vlan_rules = self.vlan_learn_ban_rules(vid, &pkt_meta);
        if !ban_vlan_rules.is_empty() {
            ofmsgs.extend(ban_vlan_rules);
            return ofmsgs;
        }

        ofmsgs.extend(self.learn_host(other_valves, vid, &pkt_meta, now));

        if self.l3 && !control_plane_handled {
            let Some(vlan) = self.dp.vlans.get_mut(&vid) else {
                return ofmsgs;
            };
            for route_manager in &self.route_managers {
                ofmsgs.extend(route_manager.add_host_fib_route_from_pkt(vlan, &mut pkt_meta, now));
            }
        }

        ofmsgs
    }

    /// Expire idle hosts from controller state. The switch ages its own
    /// flows.
    pub fn host_expire(&mut self, now: u64) {
        if !self.dp.running {
            return;
        }
        for vlan in self.dp.vlans.values_mut() {
            self.host_manager.expire_hosts_from_vlan(vlan, now);
        }
    }

    /// Re/resolve gateways on every VLAN.
    pub fn resolve_gateways(&mut self, now: u64) -> Vec<OfMsg> {
        if !self.dp.running {
            return Vec::new();
        }
        let mut ofmsgs = Vec::new();
        let vids: Vec<u16> = self.dp.vlans.keys().copied().collect();
        for vid in vids {
            for route_manager in &self.route_managers {
                let Some(vlan) = self.dp.vlans.get_mut(&vid) else {
                    continue;
                };
                ofmsgs.extend(route_manager.resolve_gateways(&self.dp.ports, vlan, now));
            }
        }
        ofmsgs
    }

    /// Advertise services (IPv6 RAs), rate-gated by `advertise_interval`.
    pub fn advertise(&mut self, now: u64) -> Vec<OfMsg> {
        if !self.dp.running
            || self.dp.advertise_interval == 0
            || now.saturating_sub(self.last_advertise_sec) <= self.dp.advertise_interval
        {
            return Vec::new();
        }
        let mut ofmsgs = Vec::new();
        for vlan in self.dp.vlans.values() {
            for route_manager in &self.route_managers {
                ofmsgs.extend(route_manager.advertise(&self.dp.ports, vlan));
            }
        }
        self.last_advertise_sec = now;
        ofmsgs
    }

    pub fn add_route(&mut self, vid: u16, ip_gw: IpAddr, ip_dst: IpNet) -> Vec<OfMsg> {
        let Some(route_manager) = self
            .route_managers
            .iter()
            .find(|rm| rm.ipv() == ip_dst.version())
        else {
            return Vec::new();
        };
        match self.dp.vlans.get_mut(&vid) {
            Some(vlan) => route_manager.add_route(vlan, ip_gw, ip_dst),
            None => Vec::new(),
        }
    }

    pub fn del_route(&mut self, vid: u16, ip_dst: IpNet) -> Vec<OfMsg> {
        let Some(route_manager) = self
            .route_managers
            .iter()
            .find(|rm| rm.ipv() == ip_dst.version())
        else {
            return Vec::new();
        };
        match self.dp.vlans.get_mut(&vid) {
            Some(vlan) => route_manager.del_route(vlan, ip_dst),
            None => Vec::new(),
        }
    }

    /// Reconcile controller state with an OFPT_FLOW_REMOVED notification
    /// from the learning tables.
    pub fn flow_timeout(&mut self, table_id: u8, match_fields: &Match) -> Vec<OfMsg> {
        let eth_src_id = self.dp.tables.eth_src.table_id;
        let eth_dst_id = self.dp.tables.eth_dst.table_id;
        if table_id != eth_src_id && table_id != eth_dst_id {
            return Vec::new();
        }
        let Some(vid) = match_fields.vlan_vid.and_then(VlanVid::vid) else {
            return Vec::new();
        };
        if let (Some(eth_src), Some(in_port)) = (match_fields.eth_src, match_fields.in_port) {
            if let Some(vlan) = self.dp.vlans.get_mut(&vid) {
                return self.host_manager.src_rule_expire(vlan, in_port, eth_src);
            }
        } else if let Some(eth_dst) = match_fields.eth_dst {
            if let Some(vlan) = self.dp.vlans.get(&vid) {
                return self.host_manager.dst_rule_expire(&self.dp, vlan, eth_dst);
            }
        }
        Vec::new()
    }

    fn get_acl_config_changes(&self, new_dp: &Dp) -> BTreeSet<String> {
        let mut changed_acls = BTreeSet::new();
        for (acl_id, new_acl) in &new_dp.acls {
            match self.dp.acls.get(acl_id) {
                None => {
                    info!(dp_id = %self.log_id, "ACL {} new", acl_id);
                    changed_acls.insert(acl_id.clone());
                }
                Some(old_acl) if old_acl != new_acl => {
                    info!(dp_id = %self.log_id, "ACL {} changed", acl_id);
                    changed_acls.insert(acl_id.clone());
                }
                Some(_) => {}
            }
        }
        changed_acls
    }

    fn get_vlan_config_changes(&self, new_dp: &mut Dp) -> (BTreeSet<u16>, BTreeSet<u16>) {
        let deleted_vlans: BTreeSet<u16> = self
            .dp
            .vlans
            .keys()
            .filter(|vid| !new_dp.vlans.contains_key(vid))
            .copied()
            .collect();

        let mut changed_vlans = BTreeSet::new();
        for (vid, new_vlan) in new_dp.vlans.iter_mut() {
            match self.dp.vlans.get(vid) {
                None => {
                    info!(dp_id = %self.log_id, "VLAN {} added", vid);
                    changed_vlans.insert(*vid);
                }
                Some(old_vlan) => {
                    if old_vlan.config_eq(new_vlan) {
                        // Unchanged VLAN and ports: dynamic state survives.
                        new_vlan.merge_dyn(old_vlan);
                    } else if !old_vlan.config_eq_ignoring_ports(new_vlan) {
                        info!(dp_id = %self.log_id, "VLAN {} config changed", vid);
                        changed_vlans.insert(*vid);
                    }
                }
            }
        }

        if deleted_vlans.is_empty() && changed_vlans.is_empty() {
            info!(dp_id = %self.log_id, "no VLAN config changes");
        }
        (deleted_vlans, changed_vlans)
    }

    fn get_port_config_changes(
        &self,
        new_dp: &Dp,
        changed_vlans: &BTreeSet<u16>,
        changed_acls: &BTreeSet<String>,
    ) -> (bool, BTreeSet<u32>, BTreeSet<u32>, BTreeSet<u32>) {
        let mut changed_ports = BTreeSet::new();
        let mut changed_acl_ports = BTreeSet::new();

        for (port_no, new_port) in &new_dp.ports {
            match self.dp.ports.get(port_no) {
                None => {
                    info!(dp_id = %self.log_id, "port {} added", port_no);
                    changed_ports.insert(*port_no);
                }
                Some(old_port) => {
                    if !new_port.config_eq(old_port) {
                        if !new_port.config_eq_ignoring_acl(old_port) {
                            info!(dp_id = %self.log_id, "port {} reconfigured", port_no);
                            changed_ports.insert(*port_no);
                        } else {
                            info!(dp_id = %self.log_id, "port {} ACL changed", port_no);
                            changed_acl_ports.insert(*port_no);
                        }
                    } else if new_port
                        .acl_in
                        .as_ref()
                        .is_some_and(|acl_id| changed_acls.contains(acl_id))
                    {
                        info!(dp_id = %self.log_id, "port {} ACL changed", port_no);
                        changed_acl_ports.insert(*port_no);
                    }
                }
            }
        }

        for vid in changed_vlans {
            if let Some(vlan) = new_dp.vlans.get(vid) {
                changed_ports.extend(vlan.port_nums());
            }
        }

        let deleted_ports: BTreeSet<u32> = self
            .dp
            .ports
            .keys()
            .filter(|port_no| !new_dp.ports.contains_key(port_no))
            .copied()
            .collect();

        let all_ports_changed = changed_ports == new_dp.ports.keys().copied().collect::<BTreeSet<u32>>();
        if all_ports_changed {
            info!(dp_id = %self.log_id, "all ports config changed");
        } else if changed_ports.is_empty()
            && deleted_ports.is_empty()
            && changed_acl_ports.is_empty()
        {
            info!(dp_id = %self.log_id, "no port config changes");
        }
        (all_ports_changed, deleted_ports, changed_ports, changed_acl_ports)
    }

    fn get_config_changes(&self, new_dp: &mut Dp) -> ConfigChanges {
        let changed_acls = self.get_acl_config_changes(new_dp);
        let (deleted_vlans, changed_vlans) = self.get_vlan_config_changes(new_dp);
        let (all_ports_changed, deleted_ports, changed_ports, changed_acl_ports) =
            self.get_port_config_changes(new_dp, &changed_vlans, &changed_acls);
        ConfigChanges {
            deleted_ports,
            changed_ports,
            changed_acl_ports,
            deleted_vlans,
            changed_vlans,
            all_ports_changed,
        }
    }

    fn apply_config_changes(
        &mut self,
        mut new_dp: Dp,
        changes: ConfigChanges,
    ) -> Result<(bool, Vec<OfMsg>)> {
        new_dp.running = true;
        let dp_id = self.dp.dp_id;

        // Link state and ban counters belong to the switch, not the
        // descriptor; surviving ports keep theirs across the swap.
        for (port_no, new_port) in new_dp.ports.iter_mut() {
            if let Some(old_port) = self.dp.ports.get(port_no) {
                new_port.phys_up = old_port.phys_up;
                new_port.learn_ban_count = old_port.learn_ban_count;
            }
        }

        if changes.all_ports_changed {
            let up_ports: Vec<u32> = changes.changed_ports.iter().copied().collect();
            self.dp = new_dp;
            self.rebuild_managers();
            self.l3 = false;
            let ofmsgs = self.datapath_connect(dp_id, &up_ports)?;
            return Ok((true, ofmsgs));
        }

        let mut ofmsgs = Vec::new();
        if !changes.deleted_ports.is_empty() {
            info!(dp_id = %self.log_id, "ports deleted: {:?}", changes.deleted_ports);
            let ports: Vec<u32> = changes.deleted_ports.iter().copied().collect();
            ofmsgs.extend(self.ports_delete(dp_id, &ports));
        }
        if !changes.deleted_vlans.is_empty() {
            info!(dp_id = %self.log_id, "VLANs deleted: {:?}", changes.deleted_vlans);
            for vid in &changes.deleted_vlans {
                if let Some(vlan) = self.dp.vlans.get(vid) {
                    ofmsgs.extend(self.del_vlan(vlan));
                }
            }
        }
        if !changes.changed_ports.is_empty() {
            let ports: Vec<u32> = changes.changed_ports.iter().copied().collect();
            ofmsgs.extend(self.ports_delete(dp_id, &ports));
        }

        self.dp = new_dp;
        self.rebuild_managers();

        if !changes.changed_vlans.is_empty() {
            info!(dp_id = %self.log_id, "VLANs changed/added: {:?}", changes.changed_vlans);
            for vid in &changes.changed_vlans {
                if let Some(vlan) = self.dp.vlans.get(vid) {
                    ofmsgs.extend(self.del_vlan(vlan));
                }
                ofmsgs.extend(self.add_vlan(*vid)?);
            }
        }
        if !changes.changed_ports.is_empty() {
            info!(dp_id = %self.log_id, "ports changed/added: {:?}", changes.changed_ports);
            let ports: Vec<u32> = changes.changed_ports.iter().copied().collect();
            ofmsgs.extend(self.ports_add(dp_id, &ports, false));
        }
        if !changes.changed_acl_ports.is_empty() {
            info!(
                dp_id = %self.log_id,
                "ports with ACL only changed: {:?}", changes.changed_acl_ports
            );
            for port_num in &changes.changed_acl_ports {
                ofmsgs.extend(self.port_add_acl(*port_num, true));
            }
        }

        Ok((false, ofmsgs))
    }

    /// Swap in a new datapath descriptor, reprogramming only what changed.
    /// Returns whether the change forced a cold start, plus the messages.
    pub fn reload_config(&mut self, mut new_dp: Dp) -> Result<(bool, Vec<OfMsg>)> {
        if !self.dp.running {
            info!(dp_id = %self.log_id, "skipping configuration because datapath not up");
            return Ok((false, Vec::new()));
        }
        info!(dp_id = %self.log_id, "reload configuration");
        let changes = self.get_config_changes(&mut new_dp);
        self.apply_config_changes(new_dp, changes)
    }

    /// Export the static configuration shape.
    pub fn update_config_metrics(&self, metrics: &FaucetMetrics) {
        metrics
            .faucet_config_dp_name
            .with_label_values(&[&self.log_id, &self.dp.name])
            .set(self.dp.dp_id as i64);
        for table in self.dp.tables.all() {
            metrics
                .faucet_config_table_names
                .with_label_values(&[&self.log_id, table.name])
                .set(i64::from(table.table_id));
        }
    }

    /// Export learning state. Stale per-MAC gauges from the previous export
    /// are zeroed before repopulating, so a shrunk cache does not leave
    /// ghosts behind.
    pub fn update_metrics(&mut self, metrics: &FaucetMetrics) {
        for labels in self.exported_mac_labels.drain(..) {
            let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
            metrics.learned_macs.with_label_values(&labels).set(0);
        }

        for vlan in self.dp.vlans.values() {
            let vid_label = vlan.vid.to_string();
            metrics
                .vlan_hosts_learned
                .with_label_values(&[&self.log_id, &vid_label])
                .set(vlan.host_cache.len() as i64);
            metrics
                .vlan_learn_bans
                .with_label_values(&[&self.log_id, &vid_label])
                .set(vlan.learn_ban_count as i64);
            for ipv in [IpVersion::V4, IpVersion::V6] {
                let neighbors = vlan.neigh_cache_by_version(ipv).count();
                metrics
                    .vlan_neighbors
                    .with_label_values(&[&self.log_id, &vid_label, &ipv.to_string()])
                    .set(neighbors as i64);
            }

            let mut hosts_on_port: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
            let mut cached: Vec<(&MacAddress, u32)> = vlan
                .host_cache
                .iter()
                .map(|(mac, entry)| (mac, entry.port_num))
                .collect();
            cached.sort_unstable();
            for (mac, port_num) in cached {
                hosts_on_port.entry(port_num).or_default().push(mac.to_u64());
            }
            for (port_num, macs) in hosts_on_port {
                for (n, mac_int) in macs.into_iter().enumerate() {
                    let labels = [
                        self.log_id.clone(),
                        vid_label.clone(),
                        port_num.to_string(),
                        n.to_string(),
                    ];
                    let label_refs: Vec<&str> = labels.iter().map(String::as_str).collect();
                    metrics
                        .learned_macs
                        .with_label_values(&label_refs)
                        .set(mac_int as i64);
                    self.exported_mac_labels.push(labels);
                }
            }
        }

        for port in self.dp.ports.values() {
            metrics
                .port_learn_bans
                .with_label_values(&[&self.log_id, &port.number.to_string()])
                .set(port.learn_ban_count as i64);
        }
    }

    /// Render the configuration for the management API.
    pub fn get_config_dict(&self) -> Value {
        let vlans: serde_json::Map<String, Value> = self
            .dp
            .vlans
            .values()
            .map(|vlan| (vlan.name.clone(), vlan.to_conf()))
            .collect();
        let acls: serde_json::Map<String, Value> = self
            .dp
            .acls
            .iter()
            .map(|(acl_id, acl)| (acl_id.clone(), acl.to_conf()))
            .collect();
        let mut dps = serde_json::Map::new();
        dps.insert(self.dp.name.clone(), self.dp.to_conf());
        json!({
            "dps": dps,
            "vlans": vlans,
            "acls": acls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faucet_config::Port;
    use faucet_of::FlowMod;

    fn test_dp() -> Dp {
        let mut dp = Dp::new(1, "dp1", "Open vSwitch");
        dp.add_vlan(Vlan::new(10)).unwrap();
        dp.add_port(Port::new(1).with_native_vlan(10)).unwrap();
        dp.add_port(Port::new(2).with_native_vlan(10)).unwrap();
        dp
    }

    fn connected() -> Valve {
        let mut valve = Valve::new(test_dp());
        valve.datapath_connect(1, &[1, 2]).unwrap();
        valve
    }

    #[test]
    fn test_factory_rejects_unknown_hardware() {
        assert!(valve_factory(Dp::new(1, "dp1", "NoSuchSwitch")).is_none());
        assert!(valve_factory(test_dp()).is_some());
    }

    #[test]
    fn test_port_status_modify_is_delete_then_add() {
        let mut valve = connected();
        let ofmsgs = valve.port_status_handler(1, 1, PortStatusReason::Modify, true);
        let first_delete = ofmsgs
            .iter()
            .position(|msg| msg.as_flowmod().is_some_and(FlowMod::is_delete));
        let first_add = ofmsgs.iter().position(|msg| {
            msg.as_flowmod()
                .is_some_and(|fm| fm.command == faucet_of::FlowModCommand::Add)
        });
        assert!(first_delete.unwrap() < first_add.unwrap());
        assert!(valve.dp().ports[&1].phys_up);

        // A down MODIFY only deletes.
        let ofmsgs = valve.port_status_handler(1, 1, PortStatusReason::Modify, false);
        assert!(!ofmsgs.is_empty());
        assert!(!valve.dp().ports[&1].phys_up);
    }

    #[test]
    fn test_diff_classifies_acl_only_change() {
        let valve = connected();
        let mut new_dp = test_dp();
        new_dp.acls.insert(
            "lockdown".into(),
            faucet_config::Acl::new(vec![faucet_config::AclRule::allow()]),
        );
        new_dp.ports.get_mut(&1).unwrap().acl_in = Some("lockdown".into());
        new_dp.port_acl_in.insert(1, "lockdown".into());

        let changes = valve.get_config_changes(&mut new_dp);
        assert_eq!(changes.changed_acl_ports, BTreeSet::from([1]));
        assert!(changes.changed_ports.is_empty());
        assert!(changes.deleted_ports.is_empty());
        assert!(!changes.all_ports_changed);
    }

    #[test]
    fn test_diff_membership_change_reprograms_port_not_vlan() {
        let valve = connected();
        let mut new_dp = test_dp();
        // Port 2 moves off the VLAN; the VLAN itself is not "changed".
        new_dp.ports.get_mut(&2).unwrap().native_vlan = None;
        new_dp.vlans.get_mut(&10).unwrap().untagged.remove(&2);

        let changes = valve.get_config_changes(&mut new_dp);
        assert!(changes.changed_vlans.is_empty());
        assert_eq!(changes.changed_ports, BTreeSet::from([2]));
    }

    #[test]
    fn test_add_route_records_pending_route() {
        let mut dp = test_dp();
        dp.vlans.get_mut(&10).unwrap().faucet_vips =
            vec![IpNet::new("10.0.0.254".parse().unwrap(), 24)];
        let mut valve = Valve::new(dp);
        valve.datapath_connect(1, &[1, 2]).unwrap();

        let dst = IpNet::new("192.0.2.0".parse().unwrap(), 24);
        let ofmsgs = valve.add_route(10, "10.0.0.2".parse().unwrap(), dst);
        assert!(ofmsgs.is_empty());
        assert!(valve.dp().vlans[&10].routes.contains_key(&dst));

        // Resolution cycle solicits the recorded gateway.
        assert!(!valve.resolve_gateways(100).is_empty());
        assert!(valve.del_route(10, dst).len() == 1);
    }

    #[test]
    fn test_advertise_gated_by_interval() {
        let mut dp = test_dp();
        dp.vlans.get_mut(&10).unwrap().faucet_vips =
            vec![IpNet::new("fc00::fe".parse().unwrap(), 64)];
        let mut valve = Valve::new(dp);
        valve.datapath_connect(1, &[1, 2]).unwrap();

        assert!(!valve.advertise(31).is_empty());
        assert!(valve.advertise(40).is_empty());
        assert!(!valve.advertise(100).is_empty());
    }
}
