use std::path::{Component, Path, PathBuf};

pub const PROC_DIR: &str = "/proc";
pub const SYS_DIR: &str = "/sys";
pub const DEV_DIR: &str = "/dev";
pub const VAR_DIR: &str = "/var";
pub const DATA_DIR: &str = "/data";
pub const SYSTEM_DIR: &str = "/system";
pub const BLOCK_DIR: &str = "/dev/block";
pub const PROPERTY_AREA: &str = "/dev/__properties__";
pub const PARTITION_TABLE: &str = "/proc/partitions";
pub const KERNEL_CMDLINE: &str = "/proc/cmdline";

/// Mount point of the multiboot partition.
pub const BOOT_DIR: &str = "/boot";
/// Per-target directory on the multiboot partition: `/boot/targets/<version>`.
pub const BOOT_TARGETS_DIR: &str = "/boot/targets";
pub const DEFAULT_TARGET: &str = "default";

/// Backing directory of the target root.
pub const TARGET_STAGING_DIR: &str = "/target_mount";
/// Target root, a bind mount of [`TARGET_STAGING_DIR`] so it can be moved onto `/`.
pub const TARGET_DIR: &str = "/target";

pub const UPPER_SYSTEM_DIR: &str = "/var/system_upper";
pub const LOWER_SYSTEM_DIR: &str = "/var/system_lower";

pub const SELF_IMAGE: &str = "/init";
pub const SELF_IMAGE_BACKUP: &str = "/boot-init";
pub const INITIAL_METADATA: &str = "/initial.metadata";
pub const STAGE_LOG: &str = "/var/boot-stages.jsonl";

/// Relative names inside the target root.
pub mod target {
    pub const BOOT: &str = "boot";
    pub const SYSTEM: &str = "system";
    pub const SYSTEM_RW: &str = "system_rw";
    pub const PROC: &str = "proc";
    pub const SYS: &str = "sys";
    pub const VAR: &str = "var";
    pub const EPHEMERAL: &str = "ephemeral";
    pub const PARTITIONS: &str = "partitions";
    pub const BUILD_PROP: &str = "system/build.prop";
    pub const CUSTOM_INIT: &str = "init.metadata.rc";
    pub const METADATA_PROPERTIES: &str = "metadata_properties.rc";
    pub const NESTED_FSTAB: &str = "fstab.virt";
    pub const NESTED_MARKER: &str = "ts_snap.txt";
    pub const INITIAL_METADATA: &str = "initial.metadata";
}

/// Maps absolute boot paths onto the filesystem the process works in.
///
/// In production the root is `/` and paths pass through unchanged. Tests
/// root the whole layout in a temporary directory.
#[derive(Debug, Clone)]
pub struct BootPaths {
    root: PathBuf,
}

impl Default for BootPaths {
    fn default() -> Self {
        Self::new("/")
    }
}

impl BootPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves an absolute boot path under the root.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let relative: PathBuf = path
            .as_ref()
            .components()
            .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
            .collect();
        self.root.join(relative)
    }

    /// Path inside the target root.
    pub fn target(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.resolve(TARGET_DIR).join(relative)
    }

    /// `/boot/targets/<version>/<file>`.
    pub fn boot_target_file(&self, version: &str, file: &str) -> PathBuf {
        self.resolve(BOOT_TARGETS_DIR).join(version).join(file)
    }
}
