use std::fs::{File, OpenOptions};
use std::path::Path;

use nix::mount::{MsFlags, mount};
use nix::sched::{CloneFlags, setns, unshare};

use crate::error::{NetworkError, Result};

/// Network namespace of the calling thread.
const SELF_NET_NS: &str = "/proc/self/ns/net";

/// Thin facade over the namespace syscalls.
///
/// Everything that changes kernel namespace state goes through here so the
/// rest of the crate deals in names and files rather than raw flags.
#[derive(Debug, Clone, Copy)]
pub struct SysClient;

impl SysClient {
    /// Create the facade, verifying that namespace files are reachable.
    ///
    /// Requires `/proc` to be mounted.
    pub fn new() -> Result<Self> {
        File::open(SELF_NET_NS).map_err(|e| NetworkError::Capability {
            capability: "sys client",
            detail: format!("{SELF_NET_NS}: {e}"),
        })?;
        Ok(Self)
    }

    /// Open a handle to a pinned namespace file.
    pub fn open_netns(&self, path: &Path) -> Result<File> {
        File::open(path).map_err(|e| NetworkError::Io {
            context: format!("open {}", path.display()),
            source: e,
        })
    }

    /// Move the process into a fresh, empty network namespace.
    pub fn unshare_netns(&self) -> Result<()> {
        unshare(CloneFlags::CLONE_NEWNET).map_err(|e| NetworkError::Sys {
            context: "unshare(CLONE_NEWNET)".into(),
            source: e,
        })
    }

    /// Switch the process into the namespace behind `ns`.
    pub fn setns(&self, ns: &File) -> Result<()> {
        setns(ns, CloneFlags::CLONE_NEWNET).map_err(|e| NetworkError::Sys {
            context: "setns(CLONE_NEWNET)".into(),
            source: e,
        })
    }

    /// Pin the current namespace at `target` with a bind mount, so it
    /// outlives any process and can be addressed by name (`ip -n`).
    pub fn pin_current_netns(&self, target: &Path) -> Result<()> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(target)
            .map_err(|e| NetworkError::Io {
                context: format!("create {}", target.display()),
                source: e,
            })?;

        mount(
            Some(SELF_NET_NS),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| NetworkError::Sys {
            context: format!("bind {SELF_NET_NS} to {}", target.display()),
            source: e,
        })
    }
}
