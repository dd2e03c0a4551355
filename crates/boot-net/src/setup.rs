use tracing::{debug, info, warn};

use crate::command::{self, format_command_display};
use crate::config::NetworkConfig;
use crate::error::Result;
use crate::executor::NamespaceAwareExecutor;
use crate::interface::{InterfaceManager, IpClient};
use crate::namespace::NamespaceManager;
use crate::sys::SysClient;

/// The full set of network capabilities, built once in dependency order.
pub struct NetworkStack {
    config: NetworkConfig,
    namespaces: NamespaceManager,
    interfaces: InterfaceManager,
    executor: NamespaceAwareExecutor,
}

/// `iptables` arguments that NAT the guest subnet out of the uplink.
fn masquerade_rule(source_cidr: &str, uplink: &str) -> Vec<String> {
    [
        "-t",
        "nat",
        "-A",
        "POSTROUTING",
        "-s",
        source_cidr,
        "-o",
        uplink,
        "-j",
        "MASQUERADE",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// `iptables` arguments that forward a TCP port on the uplink to the guest.
fn dnat_rule(uplink: &str, port: u16, guest_address: &str) -> Vec<String> {
    let port = port.to_string();
    let destination = format!("{guest_address}:{port}");
    [
        "-t",
        "nat",
        "-A",
        "PREROUTING",
        "-i",
        uplink,
        "-p",
        "tcp",
        "--dport",
        port.as_str(),
        "-j",
        "DNAT",
        "--to-destination",
        destination.as_str(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn as_strs(args: &[String]) -> Vec<&str> {
    args.iter().map(String::as_str).collect()
}

impl NetworkStack {
    /// Construct every capability in order: sys client, netlink client,
    /// namespace manager, interface manager, executor. The first failure
    /// aborts construction.
    pub fn new(config: NetworkConfig) -> Result<Self> {
        let sys = SysClient::new()?;
        let ip = IpClient::new(&config.ip_binary)?;
        let namespaces = NamespaceManager::new(sys, &config.netns_dir)?;
        let interfaces = InterfaceManager::new(ip);
        let executor = NamespaceAwareExecutor;
        Ok(Self {
            config,
            namespaces,
            interfaces,
            executor,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn create_namespaces(&mut self) -> Result<()> {
        self.namespaces
            .create(&self.config.outer_namespace, &self.config.guest_namespace)
    }

    pub fn switch_namespace(&mut self, name: &str) -> Result<()> {
        self.namespaces.switch(name)
    }

    /// Bring up the uplink and the outer↔guest link, NAT the guest out of
    /// the uplink and start the DHCP client. Must run in the outer
    /// namespace.
    pub fn configure_network_common(&self) -> Result<()> {
        let cfg = &self.config;
        let guest = Some(cfg.guest_namespace.as_str());

        self.interfaces.bring_up(None, "lo")?;
        self.interfaces.bring_up(None, &cfg.uplink)?;

        self.interfaces
            .create_veth_pair(&cfg.host_device, &cfg.guest_device, &cfg.guest_namespace)?;
        self.interfaces
            .add_address(None, &cfg.host_device, &cfg.host_cidr())?;
        self.interfaces.bring_up(None, &cfg.host_device)?;

        self.interfaces.bring_up(guest, "lo")?;
        self.interfaces
            .add_address(guest, &cfg.guest_device, &cfg.guest_cidr())?;
        self.interfaces.bring_up(guest, &cfg.guest_device)?;
        self.interfaces.add_default_route(guest, &cfg.host_address)?;

        command::exec(&cfg.sysctl_binary, &["-w", "net.ipv4.ip_forward=1"])?;
        let rule = masquerade_rule(&cfg.guest_cidr(), &cfg.uplink);
        command::exec(&cfg.iptables_binary, &as_strs(&rule))?;

        match cfg.dhcp_client.split_first() {
            Some((program, args)) => {
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                self.executor
                    .run(&self.namespaces, &cfg.outer_namespace, program, &args)?;
            }
            None => warn!("no DHCP client configured, uplink left unconfigured"),
        }

        info!(uplink = %cfg.uplink, guest = %cfg.guest_address, "common network configured");
        Ok(())
    }

    /// Forward the configured TCP ports from the uplink to the guest.
    /// Nested VMs have no outer network of their own, so host-side
    /// forwarding stands in for it.
    pub fn configure_port_forwarding(&self) -> Result<()> {
        let cfg = &self.config;
        for port in &cfg.forwarded_ports {
            let rule = dnat_rule(&cfg.uplink, *port, &cfg.guest_address);
            command::exec(&cfg.iptables_binary, &as_strs(&rule))?;
            info!(port, guest = %cfg.guest_address, "port forwarded");
        }
        Ok(())
    }

    /// Add the emulated radio link between the outer and guest namespaces.
    ///
    /// Every command names its namespace, so this works from whichever
    /// namespace the process is in.
    pub fn configure_network_mobile(&self) -> Result<()> {
        for step in mobile_steps(&self.config) {
            self.run_step(&step)?;
        }
        info!(device = %self.config.radio_guest_device, "mobile network configured");
        Ok(())
    }

    fn run_step(&self, step: &NetStep) -> Result<()> {
        debug!(command = %step.display(), "network step");
        let args = as_strs(&step.args);
        match &step.program {
            StepProgram::Ip => self.interfaces.run(&step.netns, &args),
            StepProgram::Exec(program) => self
                .executor
                .run(&self.namespaces, &step.netns, program, &args)
                .map(|_| ()),
        }
    }
}

/// Program a [`NetStep`] runs.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StepProgram {
    /// The netlink client, addressed with `ip -n <netns>`.
    Ip,
    /// Any other binary, run inside the namespace by the executor.
    Exec(String),
}

/// One network command and the namespace it must run in.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NetStep {
    netns: String,
    program: StepProgram,
    args: Vec<String>,
}

impl NetStep {
    fn ip(netns: &str, args: &[&str]) -> Self {
        Self {
            netns: netns.to_string(),
            program: StepProgram::Ip,
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn exec(netns: &str, program: &str, args: Vec<String>) -> Self {
        Self {
            netns: netns.to_string(),
            program: StepProgram::Exec(program.to_string()),
            args,
        }
    }

    /// Log form, `[netns <name>] <program> <args>`.
    fn display(&self) -> String {
        let program = match &self.program {
            StepProgram::Ip => "ip",
            StepProgram::Exec(program) => program.as_str(),
        };
        format_command_display(program, &as_strs(&self.args), Some(&self.netns))
    }
}

/// Radio link: the host end and its NAT live in the outer namespace, the
/// peer in the guest namespace.
fn mobile_steps(cfg: &NetworkConfig) -> Vec<NetStep> {
    let outer = cfg.outer_namespace.as_str();
    let guest = cfg.guest_namespace.as_str();
    let host_cidr = cfg.radio_host_cidr();
    let guest_cidr = cfg.radio_guest_cidr();
    vec![
        NetStep::ip(
            outer,
            &[
                "link",
                "add",
                cfg.radio_host_device.as_str(),
                "type",
                "veth",
                "peer",
                "name",
                cfg.radio_guest_device.as_str(),
                "netns",
                guest,
            ],
        ),
        NetStep::ip(
            outer,
            &["addr", "add", host_cidr.as_str(), "dev", cfg.radio_host_device.as_str()],
        ),
        NetStep::ip(outer, &["link", "set", cfg.radio_host_device.as_str(), "up"]),
        NetStep::ip(
            guest,
            &["addr", "add", guest_cidr.as_str(), "dev", cfg.radio_guest_device.as_str()],
        ),
        NetStep::ip(guest, &["link", "set", cfg.radio_guest_device.as_str(), "up"]),
        NetStep::exec(
            outer,
            &cfg.iptables_binary,
            masquerade_rule(&guest_cidr, &cfg.uplink),
        ),
    ]
}
