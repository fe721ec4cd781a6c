//! Flow table abstraction with priority discipline.

use std::collections::BTreeSet;

use crate::actions::{output_controller, Instruction};
use crate::matching::{Match, MatchField};
use crate::messages::{flowdel_defaults, flowmod_defaults, FlowMod};
use crate::OFPTT_ALL;

/// A named pipeline table and the builders every manager programs through.
///
/// Tables are cheap value objects owned by the datapath descriptor; the
/// valve passes them by reference into its sub-managers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowTable {
    pub table_id: u8,
    pub name: &'static str,
    /// Match fields this table may use, when the hardware restricts them.
    pub restricted_match_types: Option<BTreeSet<MatchField>>,
}

impl FlowTable {
    pub fn new(table_id: u8, name: &'static str) -> Self {
        Self {
            table_id,
            name,
            restricted_match_types: None,
        }
    }

    pub fn with_restricted_matches(mut self, fields: BTreeSet<MatchField>) -> Self {
        self.restricted_match_types = Some(fields);
        self
    }

    /// The pseudo-table addressing every table at once, for the cold-start
    /// wildcard delete.
    pub fn wildcard() -> Self {
        Self::new(OFPTT_ALL, "all")
    }

    /// An add at `priority` with the given instructions.
    pub fn flowmod(&self, match_fields: Match, priority: u16, inst: Vec<Instruction>) -> FlowMod {
        FlowMod {
            match_fields,
            priority,
            instructions: inst,
            ..flowmod_defaults(self.table_id)
        }
    }

    /// A delete of every flow matching `match_fields` (wildcard deletes all).
    pub fn flowdel(&self, match_fields: Match) -> FlowMod {
        FlowMod {
            match_fields,
            ..flowdel_defaults(self.table_id)
        }
    }

    /// A delete of every flow outputting to `out_port`.
    pub fn flowdel_out_port(&self, out_port: u32) -> FlowMod {
        FlowMod {
            out_port,
            ..flowdel_defaults(self.table_id)
        }
    }

    /// A drop: an add with an empty instruction set.
    pub fn flowdrop(&self, match_fields: Match, priority: u16) -> FlowMod {
        self.flowmod(match_fields, priority, Vec::new())
    }

    /// An add punting matching packets to the controller, with `inst`
    /// applied after the punt (e.g. a goto for the learn pipeline).
    pub fn flowcontroller(
        &self,
        match_fields: Match,
        priority: u16,
        mut inst: Vec<Instruction>,
    ) -> FlowMod {
        inst.insert(0, Instruction::ApplyActions(vec![output_controller()]));
        self.flowmod(match_fields, priority, inst)
    }
}
