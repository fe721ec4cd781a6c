//! Flow, group, meter, packet-out and table-features messages.

use std::collections::BTreeSet;

use crate::actions::{Action, Instruction};
use crate::matching::{Match, MatchField};
use crate::{CONTROLLER_METER_ID, OFPM_ALL, OFPP_ANY, OFPP_CONTROLLER};

/// Flow-mod command subset used by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowModCommand {
    Add,
    Delete,
}

/// A flow-mod message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMod {
    pub table_id: u8,
    pub command: FlowModCommand,
    pub match_fields: Match,
    pub priority: u16,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    /// Delete filter; `OFPP_ANY` matches any output port.
    pub out_port: u32,
    /// Request an OFPT_FLOW_REMOVED on expiry.
    pub send_flow_rem: bool,
    pub instructions: Vec<Instruction>,
}

impl FlowMod {
    pub fn with_idle_timeout(mut self, secs: u16) -> Self {
        self.idle_timeout = secs;
        self
    }

    pub fn with_hard_timeout(mut self, secs: u16) -> Self {
        self.hard_timeout = secs;
        self
    }

    pub fn with_send_flow_rem(mut self) -> Self {
        self.send_flow_rem = true;
        self
    }

    pub fn is_delete(&self) -> bool {
        self.command == FlowModCommand::Delete
    }

    /// True when this add carries no instructions, i.e. drops.
    pub fn is_drop(&self) -> bool {
        self.command == FlowModCommand::Add && self.instructions.is_empty()
    }

    /// Output ports named by this flow's apply-actions.
    pub fn out_ports(&self) -> Vec<u32> {
        let mut ports = Vec::new();
        for inst in &self.instructions {
            if let Instruction::ApplyActions(actions) = inst {
                for action in actions {
                    if let Action::Output(out) = action {
                        ports.push(out.port_num());
                    }
                }
            }
        }
        ports
    }
}

/// Group-mod command subset used for flooding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupModCommand {
    Add,
    Modify,
    Delete,
}

/// A group-mod message (ALL-type groups only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMod {
    pub command: GroupModCommand,
    pub group_id: u32,
    pub buckets: Vec<Vec<Action>>,
}

/// A meter-mod message (drop-band meters only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterMod {
    pub command: MeterModCommand,
    pub meter_id: u32,
    /// Drop band rate in packets per second; empty on delete.
    pub drop_pps: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterModCommand {
    Add,
    Delete,
}

/// A packet-out message carrying a control-plane reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketOut {
    pub in_port: u32,
    pub actions: Vec<Action>,
    pub data: Vec<u8>,
}

impl PacketOut {
    /// A controller-originated frame output on one port.
    pub fn to_port(port_num: u32, data: Vec<u8>) -> Self {
        Self {
            in_port: OFPP_CONTROLLER,
            actions: vec![crate::actions::output_port(port_num)],
            data,
        }
    }
}

/// One table's advertised features.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFeature {
    pub table_id: u8,
    pub name: String,
    pub match_types: BTreeSet<MatchField>,
}

/// Any message the valve can emit, in transmission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfMsg {
    FlowMod(FlowMod),
    GroupMod(GroupMod),
    MeterMod(MeterMod),
    PacketOut(PacketOut),
    TableFeatures(Vec<TableFeature>),
}

impl OfMsg {
    pub fn as_flowmod(&self) -> Option<&FlowMod> {
        match self {
            OfMsg::FlowMod(fm) => Some(fm),
            _ => None,
        }
    }
}

impl From<FlowMod> for OfMsg {
    fn from(fm: FlowMod) -> Self {
        OfMsg::FlowMod(fm)
    }
}

impl From<GroupMod> for OfMsg {
    fn from(gm: GroupMod) -> Self {
        OfMsg::GroupMod(gm)
    }
}

impl From<MeterMod> for OfMsg {
    fn from(mm: MeterMod) -> Self {
        OfMsg::MeterMod(mm)
    }
}

impl From<PacketOut> for OfMsg {
    fn from(po: PacketOut) -> Self {
        OfMsg::PacketOut(po)
    }
}

/// Delete every meter.
pub fn meterdel() -> OfMsg {
    OfMsg::MeterMod(MeterMod {
        command: MeterModCommand::Delete,
        meter_id: OFPM_ALL,
        drop_pps: None,
    })
}

/// Install a meter with a drop band at `rate_pps`.
pub fn meteradd(meter_id: u32, rate_pps: u32) -> OfMsg {
    OfMsg::MeterMod(MeterMod {
        command: MeterModCommand::Add,
        meter_id,
        drop_pps: Some(rate_pps),
    })
}

/// Install the packet-in policing meter.
pub fn controller_pps_meteradd(pps: u32) -> OfMsg {
    meteradd(CONTROLLER_METER_ID, pps)
}

/// Remove the packet-in policing meter.
pub fn controller_pps_meterdel() -> OfMsg {
    OfMsg::MeterMod(MeterMod {
        command: MeterModCommand::Delete,
        meter_id: CONTROLLER_METER_ID,
        drop_pps: None,
    })
}

/// A table-features message for the given tables.
pub fn table_features(tables: Vec<TableFeature>) -> OfMsg {
    OfMsg::TableFeatures(tables)
}

pub(crate) fn flowmod_defaults(table_id: u8) -> FlowMod {
    FlowMod {
        table_id,
        command: FlowModCommand::Add,
        match_fields: Match::default(),
        priority: 0,
        idle_timeout: 0,
        hard_timeout: 0,
        out_port: OFPP_ANY,
        send_flow_rem: false,
        instructions: Vec::new(),
    }
}

pub(crate) fn flowdel_defaults(table_id: u8) -> FlowMod {
    FlowMod {
        command: FlowModCommand::Delete,
        out_port: OFPP_ANY,
        ..flowmod_defaults(table_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{apply_actions, output_port};

    #[test]
    fn test_out_ports_reports_apply_actions() {
        let mut fm = flowmod_defaults(3);
        fm.instructions = vec![apply_actions(vec![output_port(2), output_port(7)])];
        assert_eq!(fm.out_ports(), vec![2, 7]);
    }

    #[test]
    fn test_drop_detection() {
        let fm = flowmod_defaults(0);
        assert!(fm.is_drop());
        let del = flowdel_defaults(0);
        assert!(!del.is_drop());
        assert!(del.is_delete());
    }

    #[test]
    fn test_controller_meter_builders() {
        match controller_pps_meteradd(100) {
            OfMsg::MeterMod(mm) => {
                assert_eq!(mm.meter_id, CONTROLLER_METER_ID);
                assert_eq!(mm.drop_pps, Some(100));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}
