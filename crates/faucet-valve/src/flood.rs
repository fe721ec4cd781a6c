//! Flood rules: broadcast/unknown-destination forwarding per VLAN, over
//! flat or stacked topologies, as flows or as an ALL-type group.

use tracing::debug;

use faucet_config::{Dp, Port, Vlan};
use faucet_of::actions::{apply_actions, output_in_port, output_port, Action};
use faucet_of::{groups, FlowTable, Match, OfMsg};

/// Builds the flood table contents for one datapath.
pub struct FloodManager {
    flood_table: FlowTable,
    low_priority: u16,
    high_priority: u16,
    group_table: bool,
}

impl FloodManager {
    pub fn new(dp: &Dp) -> Self {
        Self {
            flood_table: dp.tables.flood.clone(),
            low_priority: dp.priorities.low,
            high_priority: dp.priorities.high,
            group_table: dp.group_table,
        }
    }

    /// The full flood rule set for `vlan`. With `modify` the group variant
    /// rewrites its group in place; flow rules are add-replace either way,
    /// so the output is safe to resend after membership changes.
    pub fn build_flood_rules(&self, dp: &Dp, vlan: &Vlan, modify: bool) -> Vec<OfMsg> {
        if let Some(stack) = &dp.stack {
            self.build_stack_flood_rules(dp, stack, vlan)
        } else if self.group_table {
            self.build_group_flood_rules(dp, vlan, modify)
        } else {
            self.build_flat_flood_rules(dp, vlan)
        }
    }

    /// Running non-stack member ports of `vlan`, tagged and untagged.
    fn local_flood_ports<'a>(dp: &'a Dp, vlan: &Vlan) -> (Vec<&'a Port>, Vec<&'a Port>) {
        let running = |num: &u32| {
            dp.ports
                .get(num)
                .filter(|port| port.running() && port.stack.is_none())
        };
        let tagged = vlan.tagged.iter().filter_map(running).collect();
        let untagged = vlan.untagged.iter().filter_map(running).collect();
        (tagged, untagged)
    }

    fn port_outputs(ports: &[&Port], exclude: Option<u32>) -> Vec<Action> {
        let mut actions = Vec::new();
        for port in ports {
            if Some(port.number) == exclude {
                continue;
            }
            if let Some(mirror) = port.mirror {
                actions.push(output_port(mirror));
            }
            actions.push(output_port(port.number));
        }
        actions
    }

    /// Flood actions: tagged members first, then one pop for the untagged
    /// members. `extra_tagged` carries stack uplinks, which always run
    /// tagged.
    fn flood_actions(
        tagged: &[&Port],
        untagged: &[&Port],
        extra_tagged: &[Action],
    ) -> Vec<Action> {
        let mut actions = Self::port_outputs(tagged, None);
        actions.extend_from_slice(extra_tagged);
        if !untagged.is_empty() {
            actions.push(Action::PopVlan);
            actions.extend(Self::port_outputs(untagged, None));
        }
        actions
    }

    fn build_flat_flood_rules(&self, dp: &Dp, vlan: &Vlan) -> Vec<OfMsg> {
        let (tagged, untagged) = Self::local_flood_ports(dp, vlan);
        let actions = Self::flood_actions(&tagged, &untagged, &[]);
        debug!(vlan = vlan.vid, outputs = actions.len(), "flood rules built");
        vec![self
            .flood_table
            .flowmod(
                Match::new().vlan_vid(vlan.vid),
                self.low_priority,
                vec![apply_actions(actions)],
            )
            .into()]
    }

    fn build_group_flood_rules(&self, dp: &Dp, vlan: &Vlan, modify: bool) -> Vec<OfMsg> {
        let (tagged, untagged) = Self::local_flood_ports(dp, vlan);
        let mut buckets: Vec<Vec<Action>> = Vec::new();
        for port in &tagged {
            buckets.push(Self::port_outputs(&[port], None));
        }
        for port in &untagged {
            let mut bucket = vec![Action::PopVlan];
            bucket.extend(Self::port_outputs(&[port], None));
            buckets.push(bucket);
        }
        let group_msg = if modify {
            groups::flood_group_modify(vlan.vid, buckets)
        } else {
            groups::flood_group_add(vlan.vid, buckets)
        };
        vec![
            group_msg,
            self.flood_table
                .flowmod(
                    Match::new().vlan_vid(vlan.vid),
                    self.low_priority,
                    vec![apply_actions(vec![Action::Group(groups::group_id_for_vlan(
                        vlan.vid,
                    ))])],
                )
                .into(),
        ]
    }

    /// Stacked flooding. Every switch forwards flood traffic along its
    /// shortest path toward the stack root; the root reflects it down each
    /// branch, including the one it arrived on. Descending traffic fans out
    /// to local ports and away-from-root stack ports, so each member
    /// receives exactly one copy and the tree stays loop-free.
    fn build_stack_flood_rules(
        &self,
        dp: &Dp,
        stack: &faucet_config::Stack,
        vlan: &Vlan,
    ) -> Vec<OfMsg> {
        let (tagged, untagged) = Self::local_flood_ports(dp, vlan);
        let stack_ports: Vec<u32> = dp
            .stack_ports()
            .filter(|port| port.running())
            .map(|port| port.number)
            .collect();
        let mut ofmsgs = Vec::new();

        if stack.is_root(&dp.name) {
            // Reflect down every branch, the arrival branch via IN_PORT.
            for in_port in &stack_ports {
                let mut extra: Vec<Action> = stack_ports
                    .iter()
                    .filter(|num| *num != in_port)
                    .map(|num| output_port(*num))
                    .collect();
                extra.push(output_in_port());
                ofmsgs.push(
                    self.flood_table
                        .flowmod(
                            Match::new().vlan_vid(vlan.vid).in_port(*in_port),
                            self.high_priority,
                            vec![apply_actions(Self::flood_actions(
                                &tagged, &untagged, &extra,
                            ))],
                        )
                        .into(),
                );
            }
            // Locally sourced floods fan straight out.
            let extra: Vec<Action> = stack_ports.iter().map(|num| output_port(*num)).collect();
            ofmsgs.push(
                self.flood_table
                    .flowmod(
                        Match::new().vlan_vid(vlan.vid),
                        self.low_priority,
                        vec![apply_actions(Self::flood_actions(
                            &tagged, &untagged, &extra,
                        ))],
                    )
                    .into(),
            );
        } else {
            let towards_root = dp.shortest_path_port(&stack.root_name);
            if let Some(towards_root) = towards_root {
                // Descending traffic: local delivery plus away branches.
                let away: Vec<Action> = stack_ports
                    .iter()
                    .filter(|num| **num != towards_root)
                    .map(|num| output_port(*num))
                    .collect();
                ofmsgs.push(
                    self.flood_table
                        .flowmod(
                            Match::new().vlan_vid(vlan.vid).in_port(towards_root),
                            self.high_priority,
                            vec![apply_actions(Self::flood_actions(
                                &tagged, &untagged, &away,
                            ))],
                        )
                        .into(),
                );
                // Everything else climbs toward the root only; delivery
                // happens on the way back down.
                ofmsgs.push(
                    self.flood_table
                        .flowmod(
                            Match::new().vlan_vid(vlan.vid),
                            self.low_priority,
                            vec![apply_actions(vec![output_port(towards_root)])],
                        )
                        .into(),
                );
            } else {
                debug!(
                    vlan = vlan.vid,
                    "no stack path to root, flooding locally only"
                );
                ofmsgs.extend(self.build_flat_flood_rules(dp, vlan));
            }
        }
        ofmsgs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faucet_config::{Stack, StackEdge};
    use faucet_of::messages::{GroupModCommand, OfMsg};
    use faucet_of::OFPP_IN_PORT;
    use pretty_assertions::assert_eq;

    fn flat_dp() -> Dp {
        let mut dp = Dp::new(1, "dp1", "Open vSwitch");
        dp.add_vlan(Vlan::new(10)).unwrap();
        dp.add_port(Port::new(1).with_native_vlan(10)).unwrap();
        dp.add_port(Port::new(2).with_native_vlan(10)).unwrap();
        dp.add_port(Port::new(3).with_tagged_vlans([10])).unwrap();
        for port in dp.ports.values_mut() {
            port.phys_up = true;
        }
        dp
    }

    fn outputs(msg: &OfMsg) -> Vec<u32> {
        msg.as_flowmod().unwrap().out_ports()
    }

    #[test]
    fn test_flat_flood_tagged_then_untagged() {
        let dp = flat_dp();
        let manager = FloodManager::new(&dp);
        let msgs = manager.build_flood_rules(&dp, &dp.vlans[&10], false);
        assert_eq!(msgs.len(), 1);
        // Tagged member first, untagged after the pop.
        assert_eq!(outputs(&msgs[0]), vec![3, 1, 2]);
        let fm = msgs[0].as_flowmod().unwrap();
        let acts = match &fm.instructions[0] {
            faucet_of::Instruction::ApplyActions(acts) => acts,
            other => panic!("unexpected instruction {:?}", other),
        };
        assert_eq!(
            acts.iter().position(|a| *a == Action::PopVlan).unwrap(),
            1
        );
    }

    #[test]
    fn test_flood_deterministic_and_skips_down_ports() {
        let mut dp = flat_dp();
        let manager = FloodManager::new(&dp);
        let first = manager.build_flood_rules(&dp, &dp.vlans[&10], false);
        let again = manager.build_flood_rules(&dp, &dp.vlans[&10], false);
        assert_eq!(first, again);

        dp.ports.get_mut(&1).unwrap().phys_up = false;
        let without_one = manager.build_flood_rules(&dp, &dp.vlans[&10], false);
        assert_eq!(outputs(&without_one[0]), vec![3, 2]);
    }

    #[test]
    fn test_group_flood_modify_rewrites_group() {
        let mut dp = flat_dp();
        dp.group_table = true;
        let manager = FloodManager::new(&dp);

        let msgs = manager.build_flood_rules(&dp, &dp.vlans[&10], false);
        assert_eq!(msgs.len(), 2);
        match &msgs[0] {
            OfMsg::GroupMod(gm) => {
                assert_eq!(gm.command, GroupModCommand::Add);
                assert_eq!(gm.buckets.len(), 3);
            }
            other => panic!("unexpected message {:?}", other),
        }

        let msgs = manager.build_flood_rules(&dp, &dp.vlans[&10], true);
        match &msgs[0] {
            OfMsg::GroupMod(gm) => assert_eq!(gm.command, GroupModCommand::Modify),
            other => panic!("unexpected message {:?}", other),
        }
    }

    fn stacked_pair(root: bool) -> Dp {
        let name = if root { "root" } else { "leaf" };
        let mut dp = Dp::new(1, name, "Open vSwitch");
        dp.stack = Some(Stack::new(
            "root",
            vec![StackEdge {
                local_dp: "root".into(),
                local_port: 9,
                remote_dp: "leaf".into(),
                remote_port: 9,
            }],
        ));
        dp.add_vlan(Vlan::new(10)).unwrap();
        dp.add_port(Port::new(1).with_native_vlan(10)).unwrap();
        dp.add_port(Port::new(9).with_stack(if root { "leaf" } else { "root" }, 9))
            .unwrap();
        for port in dp.ports.values_mut() {
            port.phys_up = true;
        }
        dp
    }

    #[test]
    fn test_stack_leaf_floods_toward_root() {
        let dp = stacked_pair(false);
        let manager = FloodManager::new(&dp);
        let msgs = manager.build_flood_rules(&dp, &dp.vlans[&10], false);
        assert_eq!(msgs.len(), 2);

        // Descending traffic from the root delivers locally.
        let descend = msgs[0].as_flowmod().unwrap();
        assert_eq!(descend.match_fields.in_port, Some(9));
        assert_eq!(descend.out_ports(), vec![1]);

        // Locally sourced floods only climb.
        let climb = msgs[1].as_flowmod().unwrap();
        assert_eq!(climb.match_fields.in_port, None);
        assert_eq!(climb.out_ports(), vec![9]);
        assert!(climb.priority < descend.priority);
    }

    #[test]
    fn test_stack_root_reflects_down_arrival_branch() {
        let dp = stacked_pair(true);
        let manager = FloodManager::new(&dp);
        let msgs = manager.build_flood_rules(&dp, &dp.vlans[&10], false);
        assert_eq!(msgs.len(), 2);

        let reflect = msgs[0].as_flowmod().unwrap();
        assert_eq!(reflect.match_fields.in_port, Some(9));
        assert!(reflect.out_ports().contains(&OFPP_IN_PORT));
        assert!(reflect.out_ports().contains(&1));
    }
}
