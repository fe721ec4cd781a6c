//! VLAN configuration and runtime caches.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::IpAddr;

use faucet_packet::MacAddress;

use crate::net::{IpNet, IpVersion};

/// One learned host on a VLAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCacheEntry {
    pub port_num: u32,
    /// Learned on a non-stack port, i.e. this datapath is the host's edge.
    pub edge: bool,
    pub permanent: bool,
    pub cache_time: u64,
}

/// One resolved (or resolving) L3 neighbor on a VLAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub mac: Option<MacAddress>,
    pub cache_time: u64,
    /// Solicits sent without an answer.
    pub resolve_retries: u8,
    /// Earliest time the next solicit may go out.
    pub next_resolve_sec: u64,
}

impl NeighborEntry {
    pub fn unresolved(now: u64) -> Self {
        Self {
            mac: None,
            cache_time: now,
            resolve_retries: 0,
            next_resolve_sec: 0,
        }
    }

    pub fn resolved(&self) -> bool {
        self.mac.is_some()
    }
}

/// One VLAN. Configuration fields drive the differ; the caches, counters
/// and runtime-added routes below them are dynamic state, carried across a
/// reload by [`Vlan::merge_dyn`] when the configuration is unchanged.
#[derive(Debug, Clone)]
pub struct Vlan {
    pub vid: u16,
    pub name: String,
    /// Ports carrying this VLAN tagged, by port number.
    pub tagged: BTreeSet<u32>,
    /// Ports carrying this VLAN untagged, by port number.
    pub untagged: BTreeSet<u32>,
    /// Source MAC the controller answers from on this VLAN.
    pub faucet_mac: MacAddress,
    /// Gateway addresses the controller owns on this VLAN.
    pub faucet_vips: Vec<IpNet>,
    pub acl_in: Option<String>,
    pub max_hosts: Option<usize>,

    // Dynamic state.
    pub host_cache: HashMap<MacAddress, HostCacheEntry>,
    pub neigh_cache: HashMap<IpAddr, NeighborEntry>,
    /// Routes: destination network to gateway. Static entries come from
    /// configuration; more arrive at runtime via the route API.
    pub routes: BTreeMap<IpNet, IpAddr>,
    pub learn_ban_count: u64,
}

/// Default controller MAC, shared by every VLAN unless configured.
pub const DEFAULT_FAUCET_MAC: MacAddress =
    MacAddress::new([0x0e, 0x00, 0x00, 0x00, 0x00, 0x01]);

impl Vlan {
    pub fn new(vid: u16) -> Self {
        Self {
            vid,
            name: format!("VLAN {}", vid),
            tagged: BTreeSet::new(),
            untagged: BTreeSet::new(),
            faucet_mac: DEFAULT_FAUCET_MAC,
            faucet_vips: Vec::new(),
            acl_in: None,
            max_hosts: None,
            host_cache: HashMap::new(),
            neigh_cache: HashMap::new(),
            routes: BTreeMap::new(),
            learn_ban_count: 0,
        }
    }

    pub fn with_faucet_vip(mut self, vip: IpNet) -> Self {
        self.faucet_vips.push(vip);
        self
    }

    pub fn with_acl_in(mut self, acl: impl Into<String>) -> Self {
        self.acl_in = Some(acl.into());
        self
    }

    pub fn with_max_hosts(mut self, max: usize) -> Self {
        self.max_hosts = Some(max);
        self
    }

    pub fn with_route(mut self, dst: IpNet, gw: IpAddr) -> Self {
        self.routes.insert(dst, gw);
        self
    }

    /// All member port numbers, untagged then tagged, each once.
    pub fn port_nums(&self) -> Vec<u32> {
        let mut nums: Vec<u32> = self.untagged.union(&self.tagged).copied().collect();
        nums.sort_unstable();
        nums
    }

    /// IP versions with at least one VIP configured.
    pub fn ipvs(&self) -> Vec<IpVersion> {
        let mut versions: Vec<IpVersion> =
            self.faucet_vips.iter().map(|vip| vip.version()).collect();
        versions.sort_unstable();
        versions.dedup();
        versions
    }

    pub fn faucet_vips_by_version(&self, version: IpVersion) -> Vec<IpNet> {
        self.faucet_vips
            .iter()
            .filter(|vip| vip.version() == version)
            .copied()
            .collect()
    }

    /// The VIP whose subnet contains `addr`, if any.
    pub fn vip_containing(&self, addr: &IpAddr) -> Option<IpNet> {
        self.faucet_vips.iter().find(|vip| vip.contains(addr)).copied()
    }

    /// True when `addr` is one of this VLAN's VIP addresses.
    pub fn is_faucet_vip(&self, addr: &IpAddr) -> bool {
        self.faucet_vips.iter().any(|vip| vip.ip == *addr)
    }

    pub fn neigh_cache_by_version(
        &self,
        version: IpVersion,
    ) -> impl Iterator<Item = (&IpAddr, &NeighborEntry)> {
        self.neigh_cache
            .iter()
            .filter(move |(ip, _)| IpVersion::of(ip) == version)
    }

    fn config_key(
        &self,
    ) -> (
        u16,
        &str,
        MacAddress,
        &[IpNet],
        Option<&String>,
        Option<usize>,
    ) {
        (
            self.vid,
            self.name.as_str(),
            self.faucet_mac,
            self.faucet_vips.as_slice(),
            self.acl_in.as_ref(),
            self.max_hosts,
        )
    }

    /// Structural equality over every configuration field including port
    /// membership. When this holds across a reload, dynamic state survives.
    pub fn config_eq(&self, other: &Vlan) -> bool {
        self.config_key() == other.config_key()
            && self.tagged == other.tagged
            && self.untagged == other.untagged
    }

    /// Structural equality with port membership projected away. Membership
    /// changes reprogram ports, not the VLAN itself.
    pub fn config_eq_ignoring_ports(&self, other: &Vlan) -> bool {
        self.config_key() == other.config_key()
    }

    /// Render the configuration for the management API.
    pub fn to_conf(&self) -> serde_json::Value {
        serde_json::json!({
            "vid": self.vid,
            "name": self.name,
            "tagged": self.tagged,
            "untagged": self.untagged,
            "faucet_mac": self.faucet_mac.to_string(),
            "faucet_vips": self.faucet_vips.iter().map(|vip| vip.to_string()).collect::<Vec<_>>(),
            "acl_in": self.acl_in,
            "max_hosts": self.max_hosts,
        })
    }

    /// Carry dynamic state forward from the previous descriptor.
    pub fn merge_dyn(&mut self, old: &Vlan) {
        self.host_cache = old.host_cache.clone();
        self.neigh_cache = old.neigh_cache.clone();
        self.learn_ban_count = old.learn_ban_count;
        for (dst, gw) in &old.routes {
            self.routes.entry(*dst).or_insert(*gw);
        }
    }
}

impl fmt::Display for Vlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (vid {})", self.name, self.vid)
    }
}
