//! Frame codecs for the FAUCET control plane.
//!
//! The valve core never touches sockets; it receives raw packet-in payloads
//! and returns packet-out payloads. This crate owns the byte-level work:
//!
//! - [`MacAddress`]: 48-bit hardware addressing
//! - [`ethernet`]: Ethernet II framing with optional 802.1Q tags
//! - [`arp`]: ARP request/reply codec
//! - [`ipv4`] / [`icmpv6`]: the IPv4/ICMP and IPv6/ICMPv6 subsets the
//!   control plane answers (echo, neighbor discovery, router advertisement)
//!
//! All parsers are explicit-offset and bounds-checked; malformed input is a
//! typed [`PacketError`], never a panic.

pub mod arp;
pub mod ethernet;
pub mod icmpv6;
pub mod ipv4;
pub mod mac;

pub use ethernet::{EthernetFrame, ETH_TYPE_ARP, ETH_TYPE_IPV4, ETH_TYPE_IPV6, ETH_TYPE_LLDP};
pub use mac::MacAddress;

use thiserror::Error;

/// Error type for frame parsing and building.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Frame shorter than the header being decoded.
    #[error("frame truncated: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },
    /// A field held a value the codec cannot represent.
    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
    /// Payload protocol not handled by the control plane.
    #[error("unhandled protocol {0:#06x}")]
    UnhandledProtocol(u16),
}

/// Result type for frame operations.
pub type Result<T> = std::result::Result<T, PacketError>;
