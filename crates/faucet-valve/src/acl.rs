//! Translation of ACL rule descriptors into matches and instructions.

use std::collections::BTreeMap;

use faucet_config::{AclRule, Meter};
use faucet_of::actions::{apply_actions, output_port, Action, Instruction};
use faucet_of::{Match, OfMsg};

/// Build one ACL entry: the match, its instruction list, and any extra
/// messages that must accompany it.
///
/// The caller installs the result in the port_acl or vlan_acl table and
/// assigns priorities in descending rule order. `allow_inst` is the
/// terminating instruction for allowed traffic (a goto into the rest of the
/// pipeline); denied traffic simply gets no instructions.
pub fn build_acl_entry(
    rule: &AclRule,
    allow_inst: Instruction,
    meters: &BTreeMap<String, Meter>,
    port_num: Option<u32>,
    vlan_vid: Option<u16>,
) -> (Match, Vec<Instruction>, Vec<OfMsg>) {
    let mut acl_match = Match {
        eth_src: rule.eth_src,
        eth_dst: rule.eth_dst,
        eth_type: rule.eth_type,
        ip_proto: rule.ip_proto,
        ipv4_src: rule.ipv4_src,
        ipv4_dst: rule.ipv4_dst,
        ipv6_src: rule.ipv6_src,
        ipv6_dst: rule.ipv6_dst,
        tcp_src: rule.tcp_src,
        tcp_dst: rule.tcp_dst,
        udp_src: rule.udp_src,
        udp_dst: rule.udp_dst,
        ..Match::default()
    };
    if let Some(port_num) = port_num {
        acl_match = acl_match.in_port(port_num);
    }
    if let Some(vid) = rule.vlan_vid.or(vlan_vid) {
        acl_match = acl_match.vlan_vid(vid);
    }

    let mut inst = Vec::new();
    if let Some(meter_name) = &rule.actions.meter {
        if let Some(meter) = meters.get(meter_name) {
            inst.push(Instruction::Meter(meter.meter_id));
        }
    }

    let mut actions: Vec<Action> = Vec::new();
    if let Some(mirror) = rule.actions.mirror {
        actions.push(output_port(mirror));
    }
    if let Some(out) = rule.actions.output_port {
        actions.push(output_port(out));
    }
    if !actions.is_empty() {
        inst.push(apply_actions(actions));
    }

    // An explicit output consumes the frame; otherwise allowed traffic
    // continues into the pipeline.
    if rule.actions.allow && rule.actions.output_port.is_none() {
        inst.push(allow_inst);
    }

    (acl_match, inst, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use faucet_packet::ethernet::ETH_TYPE_IPV4;

    fn meters() -> BTreeMap<String, Meter> {
        BTreeMap::from([(
            "pps-cap".to_string(),
            Meter {
                meter_id: 7,
                rate_pps: 100,
            },
        )])
    }

    fn goto_vlan() -> Instruction {
        Instruction::GotoTable(1)
    }

    #[test]
    fn test_allow_rule_terminates_in_goto() {
        let rule = AclRule::allow().with_eth_type(ETH_TYPE_IPV4).with_tcp_dst(22);
        let (m, inst, extra) = build_acl_entry(&rule, goto_vlan(), &meters(), Some(1), None);
        assert_eq!(m.in_port, Some(1));
        assert_eq!(m.eth_type, Some(ETH_TYPE_IPV4));
        assert_eq!(m.tcp_dst, Some(22));
        assert_eq!(inst, vec![goto_vlan()]);
        assert!(extra.is_empty());
    }

    #[test]
    fn test_deny_rule_has_no_instructions() {
        let rule = AclRule::deny().with_tcp_dst(23);
        let (_, inst, _) = build_acl_entry(&rule, goto_vlan(), &meters(), Some(1), None);
        assert!(inst.is_empty());
    }

    #[test]
    fn test_meter_binding_precedes_actions() {
        let rule = AclRule::allow().with_meter("pps-cap").with_mirror(5);
        let (_, inst, _) = build_acl_entry(&rule, goto_vlan(), &meters(), None, Some(100));
        assert_eq!(inst.len(), 3);
        assert_eq!(inst[0], Instruction::Meter(7));
        assert_eq!(inst[1], apply_actions(vec![output_port(5)]));
        assert_eq!(inst[2], goto_vlan());
    }

    #[test]
    fn test_output_rule_consumes_frame() {
        let rule = AclRule::allow().with_output_port(9);
        let (_, inst, _) = build_acl_entry(&rule, goto_vlan(), &meters(), Some(1), None);
        // No goto after an explicit output.
        assert_eq!(inst, vec![apply_actions(vec![output_port(9)])]);
    }

    #[test]
    fn test_vlan_binding_sets_vid_match() {
        let rule = AclRule::allow();
        let (m, _, _) = build_acl_entry(&rule, goto_vlan(), &meters(), None, Some(100));
        assert!(m.vlan_vid.is_some());
        assert_eq!(m.in_port, None);
    }
}
