//! Switch port configuration and runtime state.

use std::fmt;

/// A stack link: the datapath and port on the far end of a stack port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackLink {
    pub peer_dp: String,
    pub peer_port: u32,
}

/// One switch port. Configuration fields drive the differ; `phys_up` and
/// `learn_ban_count` are runtime state and excluded from it.
#[derive(Debug, Clone)]
pub struct Port {
    pub number: u32,
    pub name: String,
    pub enabled: bool,
    pub native_vlan: Option<u16>,
    pub tagged_vlans: Vec<u16>,
    pub acl_in: Option<String>,
    pub stack: Option<StackLink>,
    /// Copy frames entering this port to the given port.
    pub mirror: Option<u32>,
    /// This port only receives mirrored traffic; all ingress is dropped.
    pub mirror_destination: bool,
    pub max_hosts: Option<usize>,
    pub permanent_learn: bool,

    // Runtime state.
    pub phys_up: bool,
    pub learn_ban_count: u64,
}

impl Port {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            name: format!("Port {}", number),
            enabled: true,
            native_vlan: None,
            tagged_vlans: Vec::new(),
            acl_in: None,
            stack: None,
            mirror: None,
            mirror_destination: false,
            max_hosts: None,
            permanent_learn: false,
            phys_up: false,
            learn_ban_count: 0,
        }
    }

    pub fn with_native_vlan(mut self, vid: u16) -> Self {
        self.native_vlan = Some(vid);
        self
    }

    pub fn with_tagged_vlans(mut self, vids: impl IntoIterator<Item = u16>) -> Self {
        self.tagged_vlans = vids.into_iter().collect();
        self
    }

    pub fn with_acl_in(mut self, acl: impl Into<String>) -> Self {
        self.acl_in = Some(acl.into());
        self
    }

    pub fn with_stack(mut self, peer_dp: impl Into<String>, peer_port: u32) -> Self {
        self.stack = Some(StackLink {
            peer_dp: peer_dp.into(),
            peer_port,
        });
        self
    }

    pub fn with_mirror(mut self, port_num: u32) -> Self {
        self.mirror = Some(port_num);
        self
    }

    pub fn with_mirror_destination(mut self) -> Self {
        self.mirror_destination = true;
        self
    }

    pub fn with_max_hosts(mut self, max: usize) -> Self {
        self.max_hosts = Some(max);
        self
    }

    pub fn with_permanent_learn(mut self) -> Self {
        self.permanent_learn = true;
        self
    }

    /// A port forwards only when both administratively enabled and
    /// physically up.
    pub fn running(&self) -> bool {
        self.enabled && self.phys_up
    }

    /// VLANs this port belongs to, native first.
    pub fn vlans(&self) -> Vec<u16> {
        let mut vids: Vec<u16> = self.native_vlan.into_iter().collect();
        vids.extend(&self.tagged_vlans);
        vids
    }

    #[allow(clippy::type_complexity)]
    fn config_key(
        &self,
    ) -> (
        u32,
        &str,
        bool,
        Option<u16>,
        &[u16],
        Option<&StackLink>,
        Option<u32>,
        bool,
        Option<usize>,
        bool,
    ) {
        (
            self.number,
            self.name.as_str(),
            self.enabled,
            self.native_vlan,
            self.tagged_vlans.as_slice(),
            self.stack.as_ref(),
            self.mirror,
            self.mirror_destination,
            self.max_hosts,
            self.permanent_learn,
        )
    }

    /// Structural equality over every configuration field.
    pub fn config_eq(&self, other: &Port) -> bool {
        self.config_key() == other.config_key() && self.acl_in == other.acl_in
    }

    /// Structural equality with the ACL binding projected away, used to
    /// classify a reload as ACL-only for this port.
    pub fn config_eq_ignoring_acl(&self, other: &Port) -> bool {
        self.config_key() == other.config_key()
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (port {})", self.name, self.number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_needs_enabled_and_up() {
        let mut port = Port::new(1);
        assert!(!port.running());
        port.phys_up = true;
        assert!(port.running());
        port.enabled = false;
        assert!(!port.running());
    }

    #[test]
    fn test_config_eq_ignores_runtime_state() {
        let mut a = Port::new(1).with_native_vlan(10);
        let mut b = Port::new(1).with_native_vlan(10);
        a.phys_up = true;
        b.learn_ban_count = 3;
        assert!(a.config_eq(&b));
    }

    #[test]
    fn test_config_eq_sees_acl_change() {
        let a = Port::new(1).with_native_vlan(10).with_acl_in("block-ssh");
        let b = Port::new(1).with_native_vlan(10);
        assert!(!a.config_eq(&b));
        assert!(a.config_eq_ignoring_acl(&b));
    }

    #[test]
    fn test_vlans_native_first() {
        let port = Port::new(1).with_native_vlan(10).with_tagged_vlans([20, 30]);
        assert_eq!(port.vlans(), vec![10, 20, 30]);
    }
}
