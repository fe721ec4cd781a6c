//! Flood group construction.

use crate::actions::Action;
use crate::messages::{GroupMod, GroupModCommand, OfMsg};
use crate::OFPG_ALL;

/// Base offset keeping VLAN flood group ids clear of meter/reserved ids.
const VLAN_GROUP_OFFSET: u32 = 0x1000;

/// The ALL-type group id carrying a VLAN's flood buckets.
pub fn group_id_for_vlan(vid: u16) -> u32 {
    VLAN_GROUP_OFFSET + u32::from(vid)
}

/// Delete every group.
pub fn delete_all() -> OfMsg {
    OfMsg::GroupMod(GroupMod {
        command: GroupModCommand::Delete,
        group_id: OFPG_ALL,
        buckets: Vec::new(),
    })
}

/// Install a VLAN's flood group.
pub fn flood_group_add(vid: u16, buckets: Vec<Vec<Action>>) -> OfMsg {
    OfMsg::GroupMod(GroupMod {
        command: GroupModCommand::Add,
        group_id: group_id_for_vlan(vid),
        buckets,
    })
}

/// Rewrite a VLAN's flood group in place after membership change.
pub fn flood_group_modify(vid: u16, buckets: Vec<Vec<Action>>) -> OfMsg {
    OfMsg::GroupMod(GroupMod {
        command: GroupModCommand::Modify,
        group_id: group_id_for_vlan(vid),
        buckets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::output_port;

    #[test]
    fn test_group_ids_distinct_per_vlan() {
        assert_ne!(group_id_for_vlan(10), group_id_for_vlan(20));
    }

    #[test]
    fn test_modify_keeps_group_id() {
        let add = flood_group_add(10, vec![vec![output_port(1)]]);
        let modify = flood_group_modify(10, vec![vec![output_port(1)]]);
        match (add, modify) {
            (OfMsg::GroupMod(a), OfMsg::GroupMod(m)) => {
                assert_eq!(a.group_id, m.group_id);
                assert_eq!(a.command, GroupModCommand::Add);
                assert_eq!(m.command, GroupModCommand::Modify);
            }
            _ => unreachable!(),
        }
    }
}
