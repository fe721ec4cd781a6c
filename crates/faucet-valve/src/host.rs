//! MAC learning on (VLAN, port): eth_src/eth_dst programming, caps and bans.

use rand::Rng;
use tracing::debug;

use faucet_config::{Dp, HostCacheEntry, Port, Vlan};
use faucet_of::actions::{apply_actions, goto_table, output_port, Action};
use faucet_of::{FlowTable, Match, OfMsg};
use faucet_packet::MacAddress;

/// A same-port relearn inside this window installs nothing; the existing
/// flows are still fresh.
const CACHE_UPDATE_GUARD_SEC: u64 = 2;

/// Programs the learning tables for one datapath.
///
/// The manager owns no cache itself: learned hosts live in each VLAN's
/// `host_cache` so they survive a reload of an unchanged VLAN.
pub struct HostManager {
    eth_src_table: FlowTable,
    eth_dst_table: FlowTable,
    learn_timeout: u16,
    learn_jitter: u16,
    learn_ban_timeout: u16,
    high_priority: u16,
    use_idle_timeout: bool,
}

impl HostManager {
    pub fn new(dp: &Dp) -> Self {
        Self {
            eth_src_table: dp.tables.eth_src.clone(),
            eth_dst_table: dp.tables.eth_dst.clone(),
            learn_timeout: dp.timeout,
            learn_jitter: dp.learn_jitter,
            learn_ban_timeout: dp.learn_ban_timeout,
            high_priority: dp.priorities.high,
            use_idle_timeout: dp.use_idle_timeout,
        }
    }

    /// Timeout for one learn entry, jittered so a refresh burst does not
    /// expire in lockstep.
    fn jittered_timeout(&self) -> u16 {
        if self.learn_jitter == 0 {
            return self.learn_timeout.max(1);
        }
        let low = self.learn_timeout.saturating_sub(self.learn_jitter).max(1);
        let high = self.learn_timeout.saturating_add(self.learn_jitter);
        rand::thread_rng().gen_range(low..=high)
    }

    pub fn hosts_learned_on_vlan_count(&self, vlan: &Vlan) -> usize {
        vlan.host_cache.len()
    }

    /// MACs currently cached against `port_num` on `vlan`.
    pub fn hosts_on_port(vlan: &Vlan, port_num: u32) -> Vec<MacAddress> {
        let mut macs: Vec<MacAddress> = vlan
            .host_cache
            .iter()
            .filter(|(_, entry)| entry.port_num == port_num)
            .map(|(mac, _)| *mac)
            .collect();
        macs.sort_unstable();
        macs
    }

    /// One drop flow banning further learning packet-ins from `port`.
    /// Reinstalling replaces the previous ban, so at most one exists.
    pub fn temp_ban_host_learning_on_port(&self, port: &Port) -> OfMsg {
        self.eth_src_table
            .flowdrop(Match::new().in_port(port.number), self.high_priority)
            .with_hard_timeout(self.learn_ban_timeout)
            .into()
    }

    /// One drop flow banning further learning packet-ins on `vlan`.
    pub fn temp_ban_host_learning_on_vlan(&self, vlan: &Vlan) -> OfMsg {
        self.eth_src_table
            .flowdrop(Match::new().vlan_vid(vlan.vid), self.high_priority)
            .with_hard_timeout(self.learn_ban_timeout)
            .into()
    }

    fn dst_actions(vlan: &Vlan, port: &Port) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(mirror) = port.mirror {
            actions.push(output_port(mirror));
        }
        if vlan.untagged.contains(&port.number) {
            actions.push(Action::PopVlan);
        }
        actions.push(output_port(port.number));
        actions
    }

    fn dst_flow(&self, vlan: &Vlan, port: &Port, eth_dst: MacAddress, idle: u16) -> OfMsg {
        let mut fm = self.eth_dst_table.flowmod(
            Match::new().vlan_vid(vlan.vid).eth_dst(eth_dst),
            self.high_priority,
            vec![apply_actions(Self::dst_actions(vlan, port))],
        );
        if idle > 0 {
            fm = fm.with_idle_timeout(idle);
            if self.use_idle_timeout {
                fm = fm.with_send_flow_rem();
            }
        }
        fm.into()
    }

    /// Learn `eth_src` on `(vlan, port)`: pin the source in eth_src, forward
    /// the destination in eth_dst, update the VLAN's host cache.
    pub fn learn_host_on_vlan_port(
        &self,
        port: &Port,
        vlan: &mut Vlan,
        eth_src: MacAddress,
        now: u64,
    ) -> Vec<OfMsg> {
        let mut ofmsgs = Vec::new();

        if let Some(entry) = vlan.host_cache.get(&eth_src) {
            if entry.permanent && entry.port_num != port.number {
                debug!(
                    vlan = vlan.vid,
                    port = port.number,
                    "not displacing permanently learned {} (on port {})",
                    eth_src,
                    entry.port_num
                );
                return ofmsgs;
            }
            if entry.port_num == port.number
                && now.saturating_sub(entry.cache_time) < CACHE_UPDATE_GUARD_SEC
            {
                return ofmsgs;
            }
            if entry.port_num != port.number {
                // Host moved; retire the stale flows before repinning.
                ofmsgs.push(
                    self.eth_src_table
                        .flowdel(Match::new().vlan_vid(vlan.vid).eth_src(eth_src))
                        .into(),
                );
                ofmsgs.push(
                    self.eth_dst_table
                        .flowdel(Match::new().vlan_vid(vlan.vid).eth_dst(eth_src))
                        .into(),
                );
            }
        }

        let (src_idle, src_hard, dst_idle) = if port.permanent_learn {
            (0, 0, 0)
        } else {
            let timeout = self.jittered_timeout();
            if self.use_idle_timeout {
                (timeout, 0, timeout)
            } else {
                // Hard-expire the source pin so it always goes before the
                // destination rule; a lingering destination with no source
                // pin floods without ever relearning.
                (0, timeout, timeout)
            }
        };

        let mut src_flow = self.eth_src_table.flowmod(
            Match::new()
                .vlan_vid(vlan.vid)
                .eth_src(eth_src)
                .in_port(port.number),
            self.high_priority,
            vec![goto_table(&self.eth_dst_table)],
        );
        if src_idle > 0 {
            src_flow = src_flow.with_idle_timeout(src_idle);
            if self.use_idle_timeout {
                src_flow = src_flow.with_send_flow_rem();
            }
        }
        if src_hard > 0 {
            src_flow = src_flow.with_hard_timeout(src_hard);
        }
        ofmsgs.push(src_flow.into());
        ofmsgs.push(self.dst_flow(vlan, port, eth_src, dst_idle));

        vlan.host_cache.insert(
            eth_src,
            HostCacheEntry {
                port_num: port.number,
                edge: port.stack.is_none(),
                permanent: port.permanent_learn,
                cache_time: now,
            },
        );
        debug!(
            vlan = vlan.vid,
            port = port.number,
            "learned {} ({} hosts on vlan)",
            eth_src,
            vlan.host_cache.len()
        );

        ofmsgs
    }

    /// Drop cache entries not re/learned within the learn timeout. The
    /// switch ages the flows itself; only controller state expires here.
    pub fn expire_hosts_from_vlan(&self, vlan: &mut Vlan, now: u64) {
        let timeout = u64::from(self.learn_timeout);
        let vid = vlan.vid;
        vlan.host_cache.retain(|mac, entry| {
            let keep = entry.permanent || now.saturating_sub(entry.cache_time) < timeout;
            if !keep {
                debug!(vlan = vid, port = entry.port_num, "expiring host {}", mac);
            }
            keep
        });
    }

    /// The switch expired a source pin: drop the cache entry and retire the
    /// matching destination rule so the host relearns cleanly.
    pub fn src_rule_expire(
        &self,
        vlan: &mut Vlan,
        in_port: u32,
        eth_src: MacAddress,
    ) -> Vec<OfMsg> {
        let mut ofmsgs = Vec::new();
        if let Some(entry) = vlan.host_cache.get(&eth_src) {
            if entry.port_num == in_port && !entry.permanent {
                vlan.host_cache.remove(&eth_src);
                ofmsgs.push(
                    self.eth_dst_table
                        .flowdel(Match::new().vlan_vid(vlan.vid).eth_dst(eth_src))
                        .into(),
                );
            }
        }
        ofmsgs
    }

    /// The switch expired a destination rule while the source pin is still
    /// live: reinstall it so known traffic keeps forwarding.
    pub fn dst_rule_expire(&self, dp: &Dp, vlan: &Vlan, eth_dst: MacAddress) -> Vec<OfMsg> {
        let mut ofmsgs = Vec::new();
        if let Some(entry) = vlan.host_cache.get(&eth_dst) {
            if let Some(port) = dp.ports.get(&entry.port_num) {
                let idle = if entry.permanent {
                    0
                } else {
                    self.jittered_timeout()
                };
                ofmsgs.push(self.dst_flow(vlan, port, eth_dst, idle));
            }
        }
        ofmsgs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faucet_of::messages::FlowModCommand;
    use faucet_of::{VlanVid, OFPVID_PRESENT};

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    fn test_dp() -> Dp {
        let mut dp = Dp::new(1, "dp1", "Open vSwitch");
        dp.add_vlan(Vlan::new(10)).unwrap();
        dp.add_port(Port::new(1).with_native_vlan(10)).unwrap();
        dp.add_port(Port::new(2).with_native_vlan(10)).unwrap();
        dp.add_port(
            Port::new(3)
                .with_native_vlan(10)
                .with_permanent_learn(),
        )
        .unwrap();
        dp
    }

    fn flowmods(msgs: &[OfMsg]) -> Vec<&faucet_of::FlowMod> {
        msgs.iter().filter_map(|m| m.as_flowmod()).collect()
    }

    #[test]
    fn test_learn_installs_src_and_dst() {
        let dp = test_dp();
        let manager = HostManager::new(&dp);
        let mut vlan = dp.vlans[&10].clone();
        let port = dp.ports[&1].clone();

        let msgs = manager.learn_host_on_vlan_port(&port, &mut vlan, mac("02:00:00:00:00:01"), 100);
        let fms = flowmods(&msgs);
        assert_eq!(fms.len(), 2);

        let src = fms[0];
        assert_eq!(src.table_id, dp.tables.eth_src.table_id);
        assert_eq!(src.match_fields.in_port, Some(1));
        assert_eq!(
            src.match_fields.vlan_vid.map(VlanVid::to_wire),
            Some(10 | OFPVID_PRESENT)
        );
        assert!(src.idle_timeout > 0);
        let low = dp.timeout - dp.learn_jitter;
        let high = dp.timeout + dp.learn_jitter;
        assert!(src.idle_timeout >= low && src.idle_timeout <= high);

        let dst = fms[1];
        assert_eq!(dst.table_id, dp.tables.eth_dst.table_id);
        assert_eq!(dst.out_ports(), vec![1]);

        assert_eq!(vlan.host_cache.len(), 1);
        assert!(vlan.host_cache[&mac("02:00:00:00:00:01")].edge);
    }

    #[test]
    fn test_relearn_within_guard_is_noop() {
        let dp = test_dp();
        let manager = HostManager::new(&dp);
        let mut vlan = dp.vlans[&10].clone();
        let port = dp.ports[&1].clone();
        let host = mac("02:00:00:00:00:01");

        assert!(!manager
            .learn_host_on_vlan_port(&port, &mut vlan, host, 100)
            .is_empty());
        assert!(manager
            .learn_host_on_vlan_port(&port, &mut vlan, host, 101)
            .is_empty());
        assert!(!manager
            .learn_host_on_vlan_port(&port, &mut vlan, host, 200)
            .is_empty());
    }

    #[test]
    fn test_host_move_deletes_old_flows() {
        let dp = test_dp();
        let manager = HostManager::new(&dp);
        let mut vlan = dp.vlans[&10].clone();
        let host = mac("02:00:00:00:00:01");

        manager.learn_host_on_vlan_port(&dp.ports[&1].clone(), &mut vlan, host, 100);
        let msgs = manager.learn_host_on_vlan_port(&dp.ports[&2].clone(), &mut vlan, host, 200);
        let fms = flowmods(&msgs);
        assert_eq!(fms.len(), 4);
        assert!(fms[0].is_delete());
        assert!(fms[1].is_delete());
        assert_eq!(vlan.host_cache[&host].port_num, 2);
    }

    #[test]
    fn test_permanent_learn_no_timeout_no_displacement() {
        let dp = test_dp();
        let manager = HostManager::new(&dp);
        let mut vlan = dp.vlans[&10].clone();
        let host = mac("02:00:00:00:00:01");

        let msgs =
            manager.learn_host_on_vlan_port(&dp.ports[&3].clone(), &mut vlan, host, 100);
        let fms = flowmods(&msgs);
        assert_eq!(fms[0].idle_timeout, 0);
        assert_eq!(fms[0].hard_timeout, 0);

        // A learn for the same MAC elsewhere must not displace it.
        let msgs =
            manager.learn_host_on_vlan_port(&dp.ports[&1].clone(), &mut vlan, host, 200);
        assert!(msgs.is_empty());
        assert_eq!(vlan.host_cache[&host].port_num, 3);
    }

    #[test]
    fn test_ban_flows_are_drops_with_hard_timeout() {
        let dp = test_dp();
        let manager = HostManager::new(&dp);

        let port_ban = manager.temp_ban_host_learning_on_port(&dp.ports[&1]);
        let fm = port_ban.as_flowmod().unwrap();
        assert!(fm.is_drop());
        assert_eq!(fm.match_fields.in_port, Some(1));
        assert_eq!(fm.hard_timeout, dp.learn_ban_timeout);

        let vlan_ban = manager.temp_ban_host_learning_on_vlan(&dp.vlans[&10]);
        let fm = vlan_ban.as_flowmod().unwrap();
        assert!(fm.is_drop());
        assert_eq!(fm.match_fields.in_port, None);
        assert!(fm.match_fields.vlan_vid.is_some());
    }

    #[test]
    fn test_expiry_keeps_fresh_and_permanent() {
        let dp = test_dp();
        let manager = HostManager::new(&dp);
        let mut vlan = dp.vlans[&10].clone();

        manager.learn_host_on_vlan_port(
            &dp.ports[&1].clone(),
            &mut vlan,
            mac("02:00:00:00:00:01"),
            100,
        );
        manager.learn_host_on_vlan_port(
            &dp.ports[&3].clone(),
            &mut vlan,
            mac("02:00:00:00:00:03"),
            100,
        );
        manager.learn_host_on_vlan_port(
            &dp.ports[&2].clone(),
            &mut vlan,
            mac("02:00:00:00:00:02"),
            350,
        );

        manager.expire_hosts_from_vlan(&mut vlan, 100 + u64::from(dp.timeout));
        assert!(!vlan.host_cache.contains_key(&mac("02:00:00:00:00:01")));
        assert!(vlan.host_cache.contains_key(&mac("02:00:00:00:00:02")));
        // Permanent entries never age out.
        assert!(vlan.host_cache.contains_key(&mac("02:00:00:00:00:03")));
    }

    #[test]
    fn test_src_rule_expire_reconciles() {
        let dp = test_dp();
        let manager = HostManager::new(&dp);
        let mut vlan = dp.vlans[&10].clone();
        let host = mac("02:00:00:00:00:01");

        manager.learn_host_on_vlan_port(&dp.ports[&1].clone(), &mut vlan, host, 100);
        let msgs = manager.src_rule_expire(&mut vlan, 1, host);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].as_flowmod().unwrap().is_delete());
        assert!(vlan.host_cache.is_empty());

        // Expiry on the wrong port is ignored.
        manager.learn_host_on_vlan_port(&dp.ports[&1].clone(), &mut vlan, host, 200);
        assert!(manager.src_rule_expire(&mut vlan, 2, host).is_empty());
        assert_eq!(vlan.host_cache.len(), 1);
    }

    #[test]
    fn test_dst_rule_expire_reinstalls_live_host() {
        let dp = test_dp();
        let manager = HostManager::new(&dp);
        let mut vlan = dp.vlans[&10].clone();
        let host = mac("02:00:00:00:00:01");

        manager.learn_host_on_vlan_port(&dp.ports[&1].clone(), &mut vlan, host, 100);
        let msgs = manager.dst_rule_expire(&dp, &vlan, host);
        assert_eq!(msgs.len(), 1);
        let fm = msgs[0].as_flowmod().unwrap();
        assert_eq!(fm.command, FlowModCommand::Add);
        assert_eq!(fm.out_ports(), vec![1]);

        assert!(manager
            .dst_rule_expire(&dp, &vlan, mac("02:00:00:00:00:99"))
            .is_empty());
    }
}
