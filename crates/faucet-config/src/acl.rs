//! ACL and meter descriptors.

use std::net::{Ipv4Addr, Ipv6Addr};

use faucet_packet::MacAddress;

/// What a matching ACL rule does with the frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AclActions {
    /// Allow the frame on through the pipeline; false drops it.
    pub allow: bool,
    /// Bind the rule to a named meter.
    pub meter: Option<String>,
    /// Copy matching frames to this port.
    pub mirror: Option<u32>,
    /// Send matching frames out this port instead of the pipeline.
    pub output_port: Option<u32>,
}

/// One ACL rule: a 5-tuple-style match plus actions. Unset fields are
/// wildcards. Rule order in the parent [`Acl`] is priority order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AclRule {
    pub eth_src: Option<MacAddress>,
    pub eth_dst: Option<MacAddress>,
    pub eth_type: Option<u16>,
    pub vlan_vid: Option<u16>,
    pub ip_proto: Option<u8>,
    pub ipv4_src: Option<(Ipv4Addr, u8)>,
    pub ipv4_dst: Option<(Ipv4Addr, u8)>,
    pub ipv6_src: Option<(Ipv6Addr, u8)>,
    pub ipv6_dst: Option<(Ipv6Addr, u8)>,
    pub tcp_src: Option<u16>,
    pub tcp_dst: Option<u16>,
    pub udp_src: Option<u16>,
    pub udp_dst: Option<u16>,
    pub actions: AclActions,
}

impl AclRule {
    /// A rule allowing everything it matches.
    pub fn allow() -> Self {
        Self {
            actions: AclActions {
                allow: true,
                ..AclActions::default()
            },
            ..Self::default()
        }
    }

    /// A rule dropping everything it matches.
    pub fn deny() -> Self {
        Self::default()
    }

    pub fn with_eth_type(mut self, eth_type: u16) -> Self {
        self.eth_type = Some(eth_type);
        self
    }

    pub fn with_ip_proto(mut self, proto: u8) -> Self {
        self.ip_proto = Some(proto);
        self
    }

    pub fn with_tcp_dst(mut self, port: u16) -> Self {
        self.tcp_dst = Some(port);
        self
    }

    pub fn with_meter(mut self, meter: impl Into<String>) -> Self {
        self.actions.meter = Some(meter.into());
        self
    }

    pub fn with_mirror(mut self, port: u32) -> Self {
        self.actions.mirror = Some(port);
        self
    }

    pub fn with_output_port(mut self, port: u32) -> Self {
        self.actions.output_port = Some(port);
        self
    }
}

/// A named, ordered list of rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acl {
    pub rules: Vec<AclRule>,
}

impl Acl {
    pub fn new(rules: Vec<AclRule>) -> Self {
        Self { rules }
    }

    /// Render the configuration for the management API.
    pub fn to_conf(&self) -> serde_json::Value {
        let rules: Vec<serde_json::Value> = self
            .rules
            .iter()
            .map(|rule| {
                serde_json::json!({
                    "eth_type": rule.eth_type,
                    "ip_proto": rule.ip_proto,
                    "tcp_dst": rule.tcp_dst,
                    "udp_dst": rule.udp_dst,
                    "allow": rule.actions.allow,
                    "meter": rule.actions.meter,
                    "mirror": rule.actions.mirror,
                    "output_port": rule.actions.output_port,
                })
            })
            .collect();
        serde_json::json!({ "rules": rules })
    }
}

/// A named meter with a drop band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meter {
    pub meter_id: u32,
    pub rate_pps: u32,
}
