use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Network layout for the outer and guest namespaces.
///
/// The outer namespace owns the real uplink. The guest namespace is reached
/// through a veth pair and NATed out of the uplink; on cellular devices a
/// second veth pair emulates the radio interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Directory where namespaces are pinned (`ip netns` convention).
    pub netns_dir: PathBuf,
    pub outer_namespace: String,
    pub guest_namespace: String,
    /// Directory read by the scripts the DHCP client triggers on lease events.
    pub interface_env_dir: PathBuf,
    pub ip_binary: String,
    pub iptables_binary: String,
    pub sysctl_binary: String,
    /// Uplink device in the outer namespace.
    pub uplink: String,
    /// DHCP client invocation run in the outer namespace.
    pub dhcp_client: Vec<String>,
    pub host_device: String,
    pub guest_device: String,
    pub host_address: String,
    pub guest_address: String,
    pub prefix_len: u8,
    /// TCP ports forwarded from the uplink to the guest in nested-VM mode.
    pub forwarded_ports: Vec<u16>,
    pub radio_host_device: String,
    pub radio_guest_device: String,
    pub radio_host_address: String,
    pub radio_guest_address: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            netns_dir: PathBuf::from("/var/run/netns"),
            outer_namespace: "outer".into(),
            guest_namespace: "guest".into(),
            interface_env_dir: PathBuf::from("/var/run/outer-interface"),
            ip_binary: "/system/bin/ip".into(),
            iptables_binary: "/system/bin/iptables".into(),
            sysctl_binary: "/system/bin/sysctl".into(),
            uplink: "eth0".into(),
            dhcp_client: vec!["/system/bin/dhcpcd".into(), "-b".into(), "eth0".into()],
            host_device: "veth-outer".into(),
            guest_device: "eth0".into(),
            host_address: "192.168.240.1".into(),
            guest_address: "192.168.240.2".into(),
            prefix_len: 30,
            forwarded_ports: vec![5555, 6444],
            radio_host_device: "radio-outer".into(),
            radio_guest_device: "rmnet0".into(),
            radio_host_address: "192.168.241.1".into(),
            radio_guest_address: "192.168.241.2".into(),
        }
    }
}

impl NetworkConfig {
    pub fn host_cidr(&self) -> String {
        format!("{}/{}", self.host_address, self.prefix_len)
    }

    pub fn guest_cidr(&self) -> String {
        format!("{}/{}", self.guest_address, self.prefix_len)
    }

    pub fn radio_host_cidr(&self) -> String {
        format!("{}/{}", self.radio_host_address, self.prefix_len)
    }

    pub fn radio_guest_cidr(&self) -> String {
        format!("{}/{}", self.radio_guest_address, self.prefix_len)
    }
}
