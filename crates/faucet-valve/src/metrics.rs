//! Prometheus gauges exported per datapath.
//!
//! Label conventions: `dp_id` is the hex datapath id, `vlan` the integer
//! VID, `port` the integer port number, and `n` a dense per-port index for
//! learned MACs (the gauge value is the MAC as a 48-bit integer).

use prometheus::{IntGaugeVec, Opts, Registry};
use std::sync::Arc;

/// Gauge collection shared by every valve in the process.
#[derive(Clone)]
pub struct FaucetMetrics {
    pub faucet_config_dp_name: IntGaugeVec,
    pub faucet_config_table_names: IntGaugeVec,
    pub vlan_hosts_learned: IntGaugeVec,
    pub vlan_learn_bans: IntGaugeVec,
    pub vlan_neighbors: IntGaugeVec,
    pub learned_macs: IntGaugeVec,
    pub port_learn_bans: IntGaugeVec,

    pub registry: Arc<Registry>,
}

impl FaucetMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let faucet_config_dp_name = IntGaugeVec::new(
            Opts::new("faucet_config_dp_name", "datapath id by configured name"),
            &["dp_id", "name"],
        )?;
        registry.register(Box::new(faucet_config_dp_name.clone()))?;

        let faucet_config_table_names = IntGaugeVec::new(
            Opts::new("faucet_config_table_names", "table id by configured name"),
            &["dp_id", "name"],
        )?;
        registry.register(Box::new(faucet_config_table_names.clone()))?;

        let vlan_hosts_learned = IntGaugeVec::new(
            Opts::new("vlan_hosts_learned", "hosts learned on a VLAN"),
            &["dp_id", "vlan"],
        )?;
        registry.register(Box::new(vlan_hosts_learned.clone()))?;

        let vlan_learn_bans = IntGaugeVec::new(
            Opts::new("vlan_learn_bans", "learn bans issued on a VLAN"),
            &["dp_id", "vlan"],
        )?;
        registry.register(Box::new(vlan_learn_bans.clone()))?;

        let vlan_neighbors = IntGaugeVec::new(
            Opts::new("vlan_neighbors", "L3 neighbors cached on a VLAN"),
            &["dp_id", "vlan", "ipv"],
        )?;
        registry.register(Box::new(vlan_neighbors.clone()))?;

        let learned_macs = IntGaugeVec::new(
            Opts::new("learned_macs", "MACs learned per port, densely indexed"),
            &["dp_id", "vlan", "port", "n"],
        )?;
        registry.register(Box::new(learned_macs.clone()))?;

        let port_learn_bans = IntGaugeVec::new(
            Opts::new("port_learn_bans", "learn bans issued on a port"),
            &["dp_id", "port"],
        )?;
        registry.register(Box::new(port_learn_bans.clone()))?;

        Ok(Self {
            faucet_config_dp_name,
            faucet_config_table_names,
            vlan_hosts_learned,
            vlan_learn_bans,
            vlan_neighbors,
            learned_macs,
            port_learn_bans,
            registry: Arc::new(registry),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauges_register_once() {
        let metrics = FaucetMetrics::new().unwrap();
        metrics
            .vlan_hosts_learned
            .with_label_values(&["0x1", "10"])
            .set(3);
        let families = metrics.registry.gather();
        assert!(families
            .iter()
            .any(|family| family.get_name() == "vlan_hosts_learned"));
    }

    #[test]
    fn test_learned_macs_label_shape() {
        let metrics = FaucetMetrics::new().unwrap();
        metrics
            .learned_macs
            .with_label_values(&["0x1", "10", "1", "0"])
            .set(0x0200_0000_0001);
        assert_eq!(
            metrics
                .learned_macs
                .with_label_values(&["0x1", "10", "1", "0"])
                .get(),
            0x0200_0000_0001
        );
    }
}
