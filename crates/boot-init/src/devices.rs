//! Device-node synthesis and kernel command line inspection.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use nix::sys::stat::SFlag;
use tracing::{debug, error, info, warn};

use crate::config::DeviceNodeSpec;
use crate::context::BootEnv;
use crate::error::{Stage, StageError, StageResult};
use crate::fsutil;
use crate::paths::{BLOCK_DIR, KERNEL_CMDLINE, PARTITION_TABLE};

/// Only this much of the kernel command line is inspected.
pub const CMDLINE_READ_LIMIT: u64 = 16 * 1024;

/// Block devices are created read/write for root only.
const BLOCK_NODE_MODE: u32 = 0o600;

/// One line of `/proc/partitions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDeviceEntry {
    pub major: u32,
    pub minor: u32,
    pub blocks: u64,
    pub name: String,
}

impl BlockDeviceEntry {
    /// Parses a table line. Only lines of exactly four whitespace-separated
    /// fields, the first three numeric, describe a device.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let major = fields.next()?.parse().ok()?;
        let minor = fields.next()?.parse().ok()?;
        let blocks = fields.next()?.parse().ok()?;
        let name = fields.next()?.to_string();
        if fields.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            blocks,
            name,
        })
    }
}

/// Parses every device line of a partition table, skipping the rest.
pub fn parse_partition_table(contents: &str) -> Vec<BlockDeviceEntry> {
    contents.lines().filter_map(BlockDeviceEntry::parse).collect()
}

pub fn create_char_devices(env: BootEnv<'_>, specs: &[DeviceNodeSpec]) -> StageResult {
    for spec in specs {
        let path = env.paths.resolve(&spec.path);
        env.kernel
            .mknod(&path, SFlag::S_IFCHR, spec.mode, spec.major, spec.minor)
            .map_err(|e| {
                error!(path = %path.display(), error = %e, "mknod failed");
                StageError::new(
                    Stage::Bootstrap,
                    format!("Could not create {}", spec.path.display()),
                )
            })?;
    }
    Ok(())
}

/// Creates `/dev/block/<name>` for every device the kernel reports.
pub fn create_block_devices(env: BootEnv<'_>) -> StageResult {
    let failed = || StageError::new(Stage::Bootstrap, "Could not create block device nodes.");

    let table_path = env.paths.resolve(PARTITION_TABLE);
    let table = std::fs::read_to_string(&table_path).map_err(|e| {
        error!(path = %table_path.display(), error = %e, "failed to read partition table");
        failed()
    })?;

    let block_dir = env.paths.resolve(BLOCK_DIR);
    fsutil::prepare_dir(&block_dir, 0o700).map_err(|e| {
        error!(path = %block_dir.display(), error = %e, "failed to prepare block device dir");
        failed()
    })?;

    for entry in parse_partition_table(&table) {
        let path = block_dir.join(&entry.name);
        env.kernel
            .mknod(
                &path,
                SFlag::S_IFBLK,
                BLOCK_NODE_MODE,
                entry.major,
                entry.minor,
            )
            .map_err(|e| {
                error!(path = %path.display(), error = %e, "mknod failed");
                failed()
            })?;
        debug!(device = %entry.name, major = entry.major, minor = entry.minor, "created block device");
    }
    Ok(())
}

/// Reports whether the kernel command line carries `marker`.
pub fn is_nested_vm(cmdline: &Path, marker: &str) -> bool {
    let file = match File::open(cmdline) {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %cmdline.display(), error = %e, "unable to read kernel command line");
            return false;
        }
    };

    let mut buf = Vec::with_capacity(CMDLINE_READ_LIMIT as usize);
    if let Err(e) = file.take(CMDLINE_READ_LIMIT).read_to_end(&mut buf) {
        warn!(path = %cmdline.display(), error = %e, "unable to read kernel command line");
        return false;
    }
    let cmdline_text = String::from_utf8_lossy(&buf);
    info!(cmdline = %cmdline_text.trim_end(), "kernel command line");
    cmdline_text.contains(marker)
}

pub fn detect_nested_vm(env: BootEnv<'_>) -> bool {
    is_nested_vm(
        &env.paths.resolve(KERNEL_CMDLINE),
        &env.config.nested_vm_marker,
    )
}
