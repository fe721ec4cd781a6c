//! OpenFlow 1.3 message model.
//!
//! The control core programs switches purely by returning ordered lists of
//! the [`OfMsg`] values defined here; encoding them onto the wire is the
//! transport layer's job. The model covers the subset of OpenFlow 1.3 the
//! pipeline uses: flow mods with OXM matches, ALL-type groups for flooding,
//! drop-band meters for packet-in policing, packet-outs for control-plane
//! replies and table-features for pipeline negotiation.
//!
//! [`FlowTable`] wraps a table id/name pair with the match and flow-mod
//! builders every manager programs through.

pub mod actions;
pub mod groups;
pub mod matching;
pub mod messages;
pub mod table;

pub use actions::{apply_actions, goto_table, output_controller, output_port, push_vlan_act};
pub use actions::{Action, Instruction, OutPort, SetField};
pub use matching::{Match, MatchField, VlanVid};
pub use messages::{FlowMod, FlowModCommand, GroupMod, MeterMod, OfMsg, PacketOut, TableFeature};
pub use table::FlowTable;

/// Reserved port: send to controller.
pub const OFPP_CONTROLLER: u32 = 0xffff_fffd;
/// Reserved port: all physical ports except ingress.
pub const OFPP_ALL: u32 = 0xffff_fffc;
/// Reserved port: wildcard for delete filters.
pub const OFPP_ANY: u32 = 0xffff_ffff;
/// Reserved port: packet-out ingress placeholder.
pub const OFPP_LOCAL: u32 = 0xffff_fffe;
/// Reserved port: send back out the ingress port.
pub const OFPP_IN_PORT: u32 = 0xffff_fff8;
/// Lowest reserved port number.
pub const OFPP_MAX: u32 = 0xffff_ff00;

/// Wildcard group id for delete filters.
pub const OFPG_ANY: u32 = 0xffff_ffff;
/// All groups, for delete-all.
pub const OFPG_ALL: u32 = 0xffff_fffc;

/// All tables, for the cold-start wildcard delete.
pub const OFPTT_ALL: u8 = 0xff;

/// All meters, for delete-all.
pub const OFPM_ALL: u32 = 0xffff_ffff;
/// Meter dedicated to policing packet-in traffic.
pub const CONTROLLER_METER_ID: u32 = 0x00ff_fffd;

/// Bit set on a VLAN VID match when a tag is present.
pub const OFPVID_PRESENT: u16 = 0x1000;
/// VID value matching untagged frames.
pub const OFPVID_NONE: u16 = 0x0000;

/// Bytes of a packet-in sent to the controller on a table miss.
pub const CONTROLLER_MAX_LEN: u16 = 256;

/// True for reserved OpenFlow port numbers (LOCAL, CONTROLLER, ...) that
/// must never be configured or programmed as switch ports.
pub fn ignore_port(port_num: u32) -> bool {
    port_num >= OFPP_MAX
}
