//! The datapath descriptor.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::{json, Value};

use crate::acl::{Acl, Meter};
use crate::port::Port;
use crate::stack::Stack;
use crate::tables::{PipelineTables, Priorities};
use crate::vlan::Vlan;
use crate::{ConfigError, Result};

/// An inter-VLAN routing domain: the VLANs between which routed traffic
/// may be forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Router {
    pub vlans: Vec<u16>,
}

/// Everything the valve knows about one datapath. Built by the
/// configuration layer, consumed read-mostly by the valve, swapped wholesale
/// on reload.
#[derive(Debug, Clone)]
pub struct Dp {
    pub dp_id: u64,
    pub name: String,
    pub hardware: String,
    pub tables: PipelineTables,
    pub priorities: Priorities,

    // Policy flags.
    pub drop_broadcast_source_address: bool,
    pub drop_spoofed_faucet_mac: bool,
    pub drop_bpdu: bool,
    pub drop_lldp: bool,
    pub use_idle_timeout: bool,
    pub proactive_learn: bool,
    pub group_table: bool,
    pub group_table_routing: bool,

    // Timers and limits, in seconds and counts.
    pub timeout: u16,
    pub learn_jitter: u16,
    pub learn_ban_timeout: u16,
    pub arp_neighbor_timeout: u64,
    pub advertise_interval: u64,
    pub max_resolve_backoff_time: u64,
    pub max_hosts_per_resolve_cycle: usize,
    pub max_host_fib_retry_count: u8,
    pub packetin_pps: Option<u32>,
    /// Process only every Nth learning packet-in within one second; zero
    /// disables the limiter.
    pub ignore_learn_ins: u64,

    pub vlans: BTreeMap<u16, Vlan>,
    pub ports: BTreeMap<u32, Port>,
    pub acls: BTreeMap<String, Acl>,
    pub meters: BTreeMap<String, Meter>,
    pub routers: BTreeMap<String, Router>,
    pub stack: Option<Stack>,
    /// Port number to bound ACL, derived from port configuration.
    pub port_acl_in: BTreeMap<u32, String>,
    /// VID to bound ACL, derived from VLAN configuration.
    pub vlan_acl_in: BTreeMap<u16, String>,

    /// Append-only OpenFlow channel debug log, when enabled.
    pub ofchannel_log: Option<PathBuf>,
    /// Directory holding vendor pipeline files for table-features variants.
    pub pipeline_config_dir: PathBuf,

    /// Set once the datapath is connected and provisioned.
    pub running: bool,
}

impl Dp {
    pub fn new(dp_id: u64, name: impl Into<String>, hardware: impl Into<String>) -> Self {
        Self {
            dp_id,
            name: name.into(),
            hardware: hardware.into(),
            tables: PipelineTables::default(),
            priorities: Priorities::default(),
            drop_broadcast_source_address: true,
            drop_spoofed_faucet_mac: true,
            drop_bpdu: true,
            drop_lldp: false,
            use_idle_timeout: true,
            proactive_learn: false,
            group_table: false,
            group_table_routing: false,
            timeout: 300,
            learn_jitter: 10,
            learn_ban_timeout: 10,
            arp_neighbor_timeout: 500,
            advertise_interval: 30,
            max_resolve_backoff_time: 32,
            max_hosts_per_resolve_cycle: 5,
            max_host_fib_retry_count: 10,
            packetin_pps: None,
            ignore_learn_ins: 3,
            vlans: BTreeMap::new(),
            ports: BTreeMap::new(),
            acls: BTreeMap::new(),
            meters: BTreeMap::new(),
            routers: BTreeMap::new(),
            stack: None,
            port_acl_in: BTreeMap::new(),
            vlan_acl_in: BTreeMap::new(),
            ofchannel_log: None,
            pipeline_config_dir: PathBuf::from("."),
            running: false,
        }
    }

    /// Register a VLAN, binding its ACL if one is named.
    pub fn add_vlan(&mut self, vlan: Vlan) -> Result<()> {
        if let Some(acl) = &vlan.acl_in {
            if !self.acls.contains_key(acl) {
                return Err(ConfigError::UnknownAcl(acl.clone()));
            }
            self.vlan_acl_in.insert(vlan.vid, acl.clone());
        }
        self.vlans.insert(vlan.vid, vlan);
        Ok(())
    }

    /// Register a port, syncing VLAN membership and its ACL binding.
    pub fn add_port(&mut self, port: Port) -> Result<()> {
        if let Some(vid) = port.native_vlan {
            let vlan = self
                .vlans
                .get_mut(&vid)
                .ok_or(ConfigError::UnknownVlan {
                    port: port.number,
                    vid,
                })?;
            vlan.untagged.insert(port.number);
        }
        for vid in &port.tagged_vlans {
            let vlan = self
                .vlans
                .get_mut(vid)
                .ok_or(ConfigError::UnknownVlan {
                    port: port.number,
                    vid: *vid,
                })?;
            vlan.tagged.insert(port.number);
        }
        if let Some(acl) = &port.acl_in {
            if !self.acls.contains_key(acl) {
                return Err(ConfigError::UnknownAcl(acl.clone()));
            }
            self.port_acl_in.insert(port.number, acl.clone());
        }
        self.ports.insert(port.number, port);
        Ok(())
    }

    pub fn add_router(&mut self, name: impl Into<String>, router: Router) -> Result<()> {
        let name = name.into();
        for vid in &router.vlans {
            if !self.vlans.contains_key(vid) {
                return Err(ConfigError::UnknownRouterVlan {
                    router: name,
                    vid: *vid,
                });
            }
        }
        self.routers.insert(name, router);
        Ok(())
    }

    /// Ports configured as stack links.
    pub fn stack_ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.values().filter(|port| port.stack.is_some())
    }

    /// The local port forwarding toward `dest_dp` over the stack.
    pub fn shortest_path_port(&self, dest_dp: &str) -> Option<u32> {
        self.stack
            .as_ref()
            .and_then(|stack| stack.shortest_path_port(&self.name, dest_dp))
    }

    /// The stack path from this datapath to the root.
    pub fn shortest_path_to_root(&self) -> Option<Vec<String>> {
        self.stack
            .as_ref()
            .and_then(|stack| stack.shortest_path_to_root(&self.name))
    }

    /// VLANs of a member port, native first.
    pub fn port_vlans(&self, port: &Port) -> Vec<&Vlan> {
        port.vlans()
            .iter()
            .filter_map(|vid| self.vlans.get(vid))
            .collect()
    }

    /// Render the configuration for the management API. Runtime state is
    /// not part of the rendering.
    pub fn to_conf(&self) -> Value {
        let ports: Value = self
            .ports
            .values()
            .map(|port| {
                (
                    port.number.to_string(),
                    json!({
                        "name": port.name,
                        "enabled": port.enabled,
                        "native_vlan": port.native_vlan,
                        "tagged_vlans": port.tagged_vlans,
                        "acl_in": port.acl_in,
                        "permanent_learn": port.permanent_learn,
                        "max_hosts": port.max_hosts,
                    }),
                )
            })
            .collect::<serde_json::Map<String, Value>>()
            .into();
        json!({
            "dp_id": self.dp_id,
            "name": self.name,
            "hardware": self.hardware,
            "ports": ports,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::AclRule;

    fn two_port_dp() -> Dp {
        let mut dp = Dp::new(1, "dp1", "Open vSwitch");
        dp.add_vlan(Vlan::new(10)).unwrap();
        dp.add_port(Port::new(1).with_native_vlan(10)).unwrap();
        dp.add_port(Port::new(2).with_native_vlan(10)).unwrap();
        dp
    }

    #[test]
    fn test_add_port_syncs_membership() {
        let dp = two_port_dp();
        let vlan = &dp.vlans[&10];
        assert_eq!(vlan.port_nums(), vec![1, 2]);
    }

    #[test]
    fn test_add_port_unknown_vlan() {
        let mut dp = Dp::new(1, "dp1", "Open vSwitch");
        let err = dp.add_port(Port::new(1).with_native_vlan(99)).unwrap_err();
        assert_eq!(err, ConfigError::UnknownVlan { port: 1, vid: 99 });
    }

    #[test]
    fn test_acl_binding_requires_known_acl() {
        let mut dp = Dp::new(1, "dp1", "Open vSwitch");
        dp.add_vlan(Vlan::new(10)).unwrap();
        let err = dp
            .add_port(Port::new(1).with_native_vlan(10).with_acl_in("nope"))
            .unwrap_err();
        assert_eq!(err, ConfigError::UnknownAcl("nope".into()));

        dp.acls
            .insert("block-ssh".into(), Acl::new(vec![AclRule::deny()]));
        dp.add_port(Port::new(1).with_native_vlan(10).with_acl_in("block-ssh"))
            .unwrap();
        assert_eq!(dp.port_acl_in[&1], "block-ssh");
    }

    #[test]
    fn test_add_router_validates_vlans() {
        let mut dp = two_port_dp();
        let err = dp
            .add_router("router-1", Router { vlans: vec![10, 99] })
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownRouterVlan {
                router: "router-1".into(),
                vid: 99
            }
        );
        dp.add_router("router-1", Router { vlans: vec![10] }).unwrap();
        assert!(dp.routers.contains_key("router-1"));
    }

    #[test]
    fn test_to_conf_renders_ports() {
        let dp = two_port_dp();
        let conf = dp.to_conf();
        assert_eq!(conf["name"], "dp1");
        assert_eq!(conf["ports"]["1"]["native_vlan"], 10);
    }
}
