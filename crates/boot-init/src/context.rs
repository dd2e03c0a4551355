use std::fmt;

use crate::config::BootConfig;
use crate::error::{Stage, StageError, StageResult};
use crate::kernel::Kernel;
use crate::paths::BootPaths;
use crate::process::ProcessControl;

/// Read-only collaborators shared by every stage.
#[derive(Clone, Copy)]
pub struct BootEnv<'a> {
    pub config: &'a BootConfig,
    pub paths: &'a BootPaths,
    pub kernel: &'a dyn Kernel,
    pub processes: &'a dyn ProcessControl,
}

/// Network namespace the orchestrator can be executing in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Owns the physical uplink.
    Outer,
    /// Where the nested operating system runs.
    Guest,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Outer => f.write_str("outer"),
            Namespace::Guest => f.write_str("guest"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceClass {
    #[default]
    Unknown,
    Wifi,
    Cellular,
}

/// Mutable facts discovered while booting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootContext {
    pub nested_vm: bool,
    pub os_version: String,
    pub device_class: DeviceClass,
    pub(crate) current_namespace: Option<Namespace>,
}

impl Default for BootContext {
    fn default() -> Self {
        Self {
            nested_vm: false,
            os_version: crate::paths::DEFAULT_TARGET.to_string(),
            device_class: DeviceClass::Unknown,
            current_namespace: None,
        }
    }
}

impl BootContext {
    pub fn current_namespace(&self) -> Option<Namespace> {
        self.current_namespace
    }

    /// Only the namespace coordinator moves the process between namespaces.
    pub(crate) fn set_current_namespace(&mut self, namespace: Namespace) {
        self.current_namespace = Some(namespace);
    }

    /// Fails `stage` unless the process is executing in `required`.
    pub fn require_namespace(&self, required: Namespace, stage: Stage) -> StageResult {
        if self.current_namespace == Some(required) {
            return Ok(());
        }
        let current = self
            .current_namespace
            .map_or_else(|| "none".to_string(), |ns| ns.to_string());
        Err(StageError::new(
            stage,
            format!("{stage} must run in the {required} namespace (current: {current})."),
        ))
    }
}
