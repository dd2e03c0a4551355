use std::path::PathBuf;

use tracing::debug;

use crate::command::{self, format_command_display};
use crate::error::{NetworkError, Result};

/// Netlink facade: link, address and route changes through `ip`.
#[derive(Debug, Clone)]
pub struct IpClient {
    binary: PathBuf,
}

/// Build the argument list for `ip`, targeting a pinned namespace by name.
fn ip_args<'a>(netns: Option<&'a str>, args: &[&'a str]) -> Vec<&'a str> {
    let mut full = Vec::with_capacity(args.len() + 2);
    if let Some(ns) = netns {
        full.push("-n");
        full.push(ns);
    }
    full.extend_from_slice(args);
    full
}

impl IpClient {
    pub fn new(binary: &str) -> Result<Self> {
        let binary = which::which(binary).map_err(|e| NetworkError::Capability {
            capability: "netlink client",
            detail: format!("{binary}: {e}"),
        })?;
        Ok(Self { binary })
    }

    /// Run `ip [-n netns] args...`.
    pub fn run(&self, netns: Option<&str>, args: &[&str]) -> Result<String> {
        let program = self.binary.to_string_lossy();
        let full = ip_args(netns, args);
        let mut cmd = std::process::Command::new(&self.binary);
        cmd.args(&full);
        let output = command::run(cmd, format_command_display(&program, &full, None))?;
        Ok(output)
    }
}

/// Interface-level operations across the outer and guest namespaces.
pub struct InterfaceManager {
    ip: IpClient,
}

impl InterfaceManager {
    pub fn new(ip: IpClient) -> Self {
        Self { ip }
    }

    /// Create a veth pair with `local` in the current namespace and `peer`
    /// inside `peer_netns`.
    pub fn create_veth_pair(&self, local: &str, peer: &str, peer_netns: &str) -> Result<()> {
        self.ip.run(
            None,
            &[
                "link", "add", local, "type", "veth", "peer", "name", peer, "netns", peer_netns,
            ],
        )?;
        debug!(local, peer, peer_netns, "veth pair created");
        Ok(())
    }

    /// Run `ip -n <netns> args...`, discarding output.
    pub fn run(&self, netns: &str, args: &[&str]) -> Result<()> {
        self.ip.run(Some(netns), args).map(|_| ())
    }

    pub fn add_address(&self, netns: Option<&str>, device: &str, cidr: &str) -> Result<()> {
        self.ip
            .run(netns, &["addr", "add", cidr, "dev", device])
            .map(|_| ())
    }

    pub fn bring_up(&self, netns: Option<&str>, device: &str) -> Result<()> {
        self.ip
            .run(netns, &["link", "set", device, "up"])
            .map(|_| ())
    }

    pub fn add_default_route(&self, netns: Option<&str>, via: &str) -> Result<()> {
        self.ip
            .run(netns, &["route", "add", "default", "via", via])
            .map(|_| ())
    }
}
