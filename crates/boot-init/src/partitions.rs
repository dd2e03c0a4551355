//! Partition lookup and filesystem mounts.

use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use tracing::{error, info};

use crate::context::BootEnv;
use crate::fsutil;

/// Disk partitions are never mounted writable or with device nodes honored.
pub const PARTITION_FLAGS: MsFlags = MsFlags::MS_RDONLY.union(MsFlags::MS_NODEV);

pub const SYSTEM_PARTITION: &str = "system";

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("failed to prepare mount point {}: {source}", path.display())]
    PrepareDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read partition table {}: {source}", path.display())]
    ReadTable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("partition {name} not found in {}", table.display())]
    PartitionNotFound { name: String, table: PathBuf },

    #[error("mount of {} failed: {source}", target.display())]
    Mount {
        target: PathBuf,
        #[source]
        source: nix::Error,
    },
}

/// A single filesystem mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub fstype: String,
    pub source: Option<String>,
    /// Appended to `source` when non-zero.
    pub partition: u32,
    pub target: PathBuf,
    pub flags: MsFlags,
}

impl MountSpec {
    /// Read-only, nodev mount of a disk or partition.
    pub fn partition(fstype: &str, disk: &str, partition: u32, target: PathBuf) -> Self {
        Self {
            fstype: fstype.into(),
            source: Some(disk.into()),
            partition,
            target,
            flags: PARTITION_FLAGS,
        }
    }

    /// Pseudo filesystem without a backing device.
    pub fn virtual_fs(fstype: &str, target: PathBuf) -> Self {
        Self {
            fstype: fstype.into(),
            source: None,
            partition: 0,
            target,
            flags: MsFlags::empty(),
        }
    }

    /// Effective device: `source` followed by the partition number, if any.
    pub fn device(&self) -> Option<String> {
        let source = self.source.as_deref().filter(|s| !s.is_empty())?;
        if self.partition > 0 {
            Some(format!("{source}{}", self.partition))
        } else {
            Some(source.to_string())
        }
    }
}

/// Prepares the mount point (0700) and mounts `spec`.
pub fn mount_filesystem(env: BootEnv<'_>, spec: &MountSpec) -> Result<(), MountError> {
    fsutil::prepare_dir(&spec.target, 0o700).map_err(|source| MountError::PrepareDir {
        path: spec.target.clone(),
        source,
    })?;
    let device = spec.device();
    env.kernel
        .mount(
            device.as_deref(),
            &spec.target,
            Some(spec.fstype.as_str()),
            spec.flags,
            None,
        )
        .map_err(|source| MountError::Mount {
            target: spec.target.clone(),
            source,
        })
}

/// Mounts a `nosuid` tmpfs at `target`, preparing the mount point (0700).
pub fn mount_tmpfs(env: BootEnv<'_>, target: &Path, options: &str) -> Result<(), MountError> {
    fsutil::prepare_dir(target, 0o700).map_err(|source| MountError::PrepareDir {
        path: target.to_path_buf(),
        source,
    })?;
    env.kernel
        .mount(
            Some("tmpfs"),
            target,
            Some("tmpfs"),
            MsFlags::MS_NOSUID,
            Some(options),
        )
        .map_err(|source| MountError::Mount {
            target: target.to_path_buf(),
            source,
        })
}

/// Finds the number of partition `name` in a partition listing.
///
/// Data lines start with the partition number and end with the partition
/// name; every other line is ignored.
pub fn partition_number(listing: &str, name: &str) -> Option<u32> {
    listing.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let number = fields.next()?.parse().ok()?;
        (fields.last()? == name).then_some(number)
    })
}

fn lookup_partition(table: &Path, name: &str) -> Result<u32, MountError> {
    let listing = std::fs::read_to_string(table).map_err(|source| MountError::ReadTable {
        path: table.to_path_buf(),
        source,
    })?;
    partition_number(&listing, name).ok_or_else(|| MountError::PartitionNotFound {
        name: name.into(),
        table: table.to_path_buf(),
    })
}

/// Mounts the system partition read-only at `mount_point`.
///
/// Nested VMs use the fixed system disk; otherwise the partition number is
/// looked up in `partition_table` on the multiboot disk.
pub fn mount_system_partition(
    env: BootEnv<'_>,
    nested_vm: bool,
    partition_table: &Path,
    mount_point: PathBuf,
) -> Result<(), MountError> {
    let spec = if nested_vm {
        MountSpec::partition("ext4", &env.config.nested_system_device, 0, mount_point)
    } else {
        let number = lookup_partition(partition_table, SYSTEM_PARTITION)?;
        MountSpec::partition("ext4", &env.config.multiboot_device, number, mount_point)
    };
    mount_filesystem(env, &spec).inspect_err(|e| {
        error!(device = ?spec.device(), error = %e, "unable to mount system partition");
    })?;
    info!(device = ?spec.device(), target = %spec.target.display(), "mounted system partition");
    Ok(())
}
