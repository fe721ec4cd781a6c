//! The fixed pipeline: table ids, names and priority levels.

use faucet_of::{FlowTable, MatchField};

/// Table ids in pipeline order. The valve assumes these semantic names;
/// hardware variants may restrict per-table match sets but not reorder.
pub const PORT_ACL_ID: u8 = 0;
pub const VLAN_ID: u8 = 1;
pub const VLAN_ACL_ID: u8 = 2;
pub const ETH_SRC_ID: u8 = 3;
pub const IPV4_FIB_ID: u8 = 4;
pub const IPV6_FIB_ID: u8 = 5;
pub const VIP_ID: u8 = 6;
pub const ETH_DST_ID: u8 = 7;
pub const FLOOD_ID: u8 = 8;

/// The four priority levels every rule is installed at. ACL rules count
/// down from `highest`, so `highest - high` bounds the rules per ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priorities {
    pub lowest: u16,
    pub low: u16,
    pub high: u16,
    pub highest: u16,
}

impl Default for Priorities {
    fn default() -> Self {
        Self {
            lowest: 0,
            low: 9000,
            high: 9001,
            highest: 9099,
        }
    }
}

/// The named tables of one datapath's pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineTables {
    pub port_acl: FlowTable,
    pub vlan: FlowTable,
    pub vlan_acl: FlowTable,
    pub eth_src: FlowTable,
    pub ipv4_fib: FlowTable,
    pub ipv6_fib: FlowTable,
    pub vip: FlowTable,
    pub eth_dst: FlowTable,
    pub flood: FlowTable,
}

impl Default for PipelineTables {
    fn default() -> Self {
        Self {
            port_acl: FlowTable::new(PORT_ACL_ID, "port_acl"),
            vlan: FlowTable::new(VLAN_ID, "vlan"),
            vlan_acl: FlowTable::new(VLAN_ACL_ID, "vlan_acl"),
            eth_src: FlowTable::new(ETH_SRC_ID, "eth_src"),
            ipv4_fib: FlowTable::new(IPV4_FIB_ID, "ipv4_fib"),
            ipv6_fib: FlowTable::new(IPV6_FIB_ID, "ipv6_fib"),
            vip: FlowTable::new(VIP_ID, "vip"),
            eth_dst: FlowTable::new(ETH_DST_ID, "eth_dst"),
            flood: FlowTable::new(FLOOD_ID, "flood"),
        }
    }
}

impl PipelineTables {
    /// Every table, in id order.
    pub fn all(&self) -> [&FlowTable; 9] {
        [
            &self.port_acl,
            &self.vlan,
            &self.vlan_acl,
            &self.eth_src,
            &self.ipv4_fib,
            &self.ipv6_fib,
            &self.vip,
            &self.eth_dst,
            &self.flood,
        ]
    }

    pub fn by_id(&self, table_id: u8) -> Option<&FlowTable> {
        self.all().into_iter().find(|t| t.table_id == table_id)
    }

    /// Tables whose installed flows match on `in_port`, wiped together when
    /// a port goes away.
    pub fn in_port_tables(&self) -> [&FlowTable; 4] {
        [&self.port_acl, &self.vlan, &self.eth_src, &self.flood]
    }

    /// Tables whose installed flows match on a VLAN tag, wiped together
    /// when a VLAN goes away. The vlan table itself is excluded: its rules
    /// match `(in_port, vid)` and are removed by port operations.
    pub fn vlan_match_tables(&self) -> [&FlowTable; 7] {
        [
            &self.vlan_acl,
            &self.eth_src,
            &self.ipv4_fib,
            &self.ipv6_fib,
            &self.vip,
            &self.eth_dst,
            &self.flood,
        ]
    }

    /// Apply per-table restricted match sets, keyed by table name.
    pub fn restrict_matches(
        &mut self,
        restrictions: impl IntoIterator<Item = (&'static str, std::collections::BTreeSet<MatchField>)>,
    ) {
        for (name, fields) in restrictions {
            let table = match name {
                "port_acl" => &mut self.port_acl,
                "vlan" => &mut self.vlan,
                "vlan_acl" => &mut self.vlan_acl,
                "eth_src" => &mut self.eth_src,
                "ipv4_fib" => &mut self.ipv4_fib,
                "ipv6_fib" => &mut self.ipv6_fib,
                "vip" => &mut self.vip,
                "eth_dst" => &mut self.eth_dst,
                "flood" => &mut self.flood,
                _ => continue,
            };
            table.restricted_match_types = Some(fields);
        }
    }
}
