//! Per-datapath control logic for an OpenFlow 1.3 learning switch.
//!
//! One [`Valve`] owns one datapath: it turns lifecycle events, packet-ins
//! and configuration reloads into ordered lists of OpenFlow messages that
//! program a multi-table pipeline (VLANs, ACLs, L2 learning with caps and
//! bans, flooding over flat or stacked topologies, and optional L3 routing).
//! The valve only builds messages; the caller owns the OpenFlow channel and
//! transmits them in order.
//!
//! # Architecture
//!
//! ```text
//! [event] ──> [Valve] ──┬─> HostManager   (eth_src / eth_dst learning)
//!                       ├─> FloodManager  (flood table, groups, stacking)
//!                       ├─> RouteManager  (×2: IPv4, IPv6 FIB + control plane)
//!                       └─> ACL builder   (port_acl / vlan_acl)
//!                  └────────> ordered Vec<OfMsg> back to the caller
//! ```
//!
//! All entry points are synchronous and run to completion; a valve is
//! driven from a single-threaded event loop and takes no locks.

pub mod acl;
pub mod flood;
pub mod host;
pub mod meta;
pub mod metrics;
pub mod oflog;
pub mod route;
pub mod tfm;
pub mod valve;

pub use meta::PacketMeta;
pub use metrics::FaucetMetrics;
pub use tfm::SwitchVariant;
pub use valve::{valve_factory, PortStatusReason, Valve};

use thiserror::Error;

/// Error type for valve operations.
///
/// The valve degrades almost every fault to a logged line plus an empty or
/// partial message list; the only error crossing the public boundary is a
/// configuration contradiction detected while provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValveError {
    /// Routing (a configured VIP) on a stacked datapath is not supported.
    #[error("stacking and routing cannot be combined on dp {dp_id:#x}")]
    StackingWithRouting { dp_id: u64 },
}

/// Result type for valve operations.
pub type Result<T> = std::result::Result<T, ValveError>;
