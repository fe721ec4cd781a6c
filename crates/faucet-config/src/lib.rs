//! Datapath descriptor model.
//!
//! A [`Dp`] is the parsed, validated configuration of one datapath: its
//! pipeline tables and priorities, VLANs, ports, ACLs, meters, routers and
//! optional stack topology. The valve consumes a `Dp` as input only (it
//! never parses configuration files) and swaps in a replacement descriptor
//! on reload.
//!
//! VLANs and ports carry both configuration and runtime state (host caches,
//! link state, ban counters). The reload differ compares configuration only,
//! through the explicit structural projections on [`Vlan`] and [`Port`], and
//! [`Vlan::merge_dyn`] carries runtime state forward across a reload when a
//! VLAN is structurally unchanged.

pub mod acl;
pub mod dp;
pub mod net;
pub mod port;
pub mod stack;
pub mod tables;
pub mod vlan;

pub use acl::{Acl, AclActions, AclRule, Meter};
pub use dp::{Dp, Router};
pub use net::{IpNet, IpVersion};
pub use port::{Port, StackLink};
pub use stack::{Stack, StackEdge};
pub use tables::{PipelineTables, Priorities};
pub use vlan::{HostCacheEntry, NeighborEntry, Vlan};

use thiserror::Error;

/// Error type for descriptor construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A port references a VLAN the datapath does not carry.
    #[error("port {port} references unknown VLAN {vid}")]
    UnknownVlan { port: u32, vid: u16 },
    /// A port or VLAN references an ACL the datapath does not define.
    #[error("unknown ACL {0}")]
    UnknownAcl(String),
    /// A router references a VLAN the datapath does not carry.
    #[error("router {router} references unknown VLAN {vid}")]
    UnknownRouterVlan { router: String, vid: u16 },
}

/// Result type for descriptor construction.
pub type Result<T> = std::result::Result<T, ConfigError>;
