//! Actions and instructions.

use faucet_packet::MacAddress;

use crate::{CONTROLLER_MAX_LEN, OFPP_CONTROLLER};

/// An output target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutPort {
    Port(u32),
    Controller { max_len: u16 },
}

impl OutPort {
    pub fn port_num(&self) -> u32 {
        match self {
            OutPort::Port(num) => *num,
            OutPort::Controller { .. } => OFPP_CONTROLLER,
        }
    }
}

/// A set-field action payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetField {
    /// VID written with the presence bit set.
    VlanVid(u16),
    EthSrc(MacAddress),
    EthDst(MacAddress),
}

/// An OpenFlow action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Output(OutPort),
    /// Push an 802.1Q header (ethertype 0x8100).
    PushVlan,
    PopVlan,
    SetField(SetField),
    DecNwTtl,
    Group(u32),
}

/// An OpenFlow instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    ApplyActions(Vec<Action>),
    GotoTable(u8),
    Meter(u32),
}

/// Goto-table instruction for a table.
pub fn goto_table(table: &crate::FlowTable) -> Instruction {
    Instruction::GotoTable(table.table_id)
}

/// Apply-actions instruction.
pub fn apply_actions(actions: Vec<Action>) -> Instruction {
    Instruction::ApplyActions(actions)
}

/// Actions pushing an 802.1Q tag carrying `vid`.
pub fn push_vlan_act(vid: u16) -> Vec<Action> {
    vec![Action::PushVlan, Action::SetField(SetField::VlanVid(vid))]
}

/// Output action to a switch port.
pub fn output_port(port_num: u32) -> Action {
    Action::Output(OutPort::Port(port_num))
}

/// Output action punting to the controller.
pub fn output_controller() -> Action {
    Action::Output(OutPort::Controller {
        max_len: CONTROLLER_MAX_LEN,
    })
}

/// Output action reflecting back out the ingress port.
pub fn output_in_port() -> Action {
    Action::Output(OutPort::Port(crate::OFPP_IN_PORT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_vlan_act_shape() {
        let acts = push_vlan_act(100);
        assert_eq!(
            acts,
            vec![Action::PushVlan, Action::SetField(SetField::VlanVid(100))]
        );
    }

    #[test]
    fn test_controller_out_port() {
        let act = output_controller();
        match act {
            Action::Output(out) => assert_eq!(out.port_num(), OFPP_CONTROLLER),
            other => panic!("unexpected action {:?}", other),
        }
    }
}
