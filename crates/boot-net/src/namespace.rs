use std::collections::HashMap;
use std::fs::{self, File};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{NetworkError, Result};
use crate::sys::SysClient;

/// Named network namespaces pinned under a runtime directory.
pub struct NamespaceManager {
    sys: SysClient,
    dir: PathBuf,
    namespaces: HashMap<String, File>,
}

impl NamespaceManager {
    pub fn new(sys: SysClient, dir: &Path) -> Result<Self> {
        if !dir.is_absolute() {
            return Err(NetworkError::Capability {
                capability: "namespace manager",
                detail: format!("namespace directory must be absolute: {}", dir.display()),
            });
        }
        Ok(Self {
            sys,
            dir: dir.to_path_buf(),
            namespaces: HashMap::new(),
        })
    }

    /// Pinned location of a namespace.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Pin the current namespace as `outer` and create a fresh `guest`
    /// namespace next to it. The process ends up back in `outer`.
    pub fn create(&mut self, outer: &str, guest: &str) -> Result<()> {
        if !self.namespaces.is_empty() {
            return Err(NetworkError::AlreadyCreated);
        }

        fs::create_dir_all(&self.dir).map_err(|e| NetworkError::Io {
            context: format!("create {}", self.dir.display()),
            source: e,
        })?;

        let outer_path = self.path(outer);
        self.sys.pin_current_netns(&outer_path)?;
        let outer_ns = self.sys.open_netns(&outer_path)?;

        self.sys.unshare_netns()?;
        let guest_path = self.path(guest);
        self.sys.pin_current_netns(&guest_path)?;
        let guest_ns = self.sys.open_netns(&guest_path)?;

        self.sys.setns(&outer_ns)?;

        self.namespaces.insert(outer.to_string(), outer_ns);
        self.namespaces.insert(guest.to_string(), guest_ns);
        info!(outer, guest, dir = %self.dir.display(), "network namespaces created");
        Ok(())
    }

    /// Switch the whole process into a named namespace.
    pub fn switch(&mut self, name: &str) -> Result<()> {
        let ns = self
            .namespaces
            .get(name)
            .ok_or_else(|| NetworkError::UnknownNamespace(name.to_string()))?;
        self.sys.setns(ns)?;
        info!(namespace = name, "switched network namespace");
        Ok(())
    }

    /// Descriptor of a named namespace, valid while the manager lives.
    pub fn descriptor(&self, name: &str) -> Result<BorrowedFd<'_>> {
        self.namespaces
            .get(name)
            .map(|f| f.as_fd())
            .ok_or_else(|| NetworkError::UnknownNamespace(name.to_string()))
    }
}
