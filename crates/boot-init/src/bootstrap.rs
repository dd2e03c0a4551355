//! Minimal environment needed before anything else can run.

use tracing::{error, info};

use crate::boot_mount::BootPartitionMount;
use crate::context::{BootContext, BootEnv};
use crate::devices;
use crate::error::{Stage, StageError, StageResult};
use crate::fsutil;
use crate::partitions::{self, MountSpec};
use crate::property_area;
use crate::paths::{
    BOOT_TARGETS_DIR, DATA_DIR, DEFAULT_TARGET, DEV_DIR, PROC_DIR, PROPERTY_AREA, SYS_DIR,
    SYSTEM_DIR, VAR_DIR,
};

pub const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

const STAGING_TMPFS_OPTIONS: &str = "mode=0755";

fn fail(cause: impl Into<String>) -> StageError {
    StageError::new(Stage::Bootstrap, cause)
}

/// Mounts pseudo filesystems and staging tmpfs, synthesizes device nodes,
/// detects nested-VM mode and mounts the default system partition so the
/// network stage can run its helpers.
pub fn initialize_min_environment(env: BootEnv<'_>, ctx: &mut BootContext) -> StageResult {
    for (fstype, dir) in [("proc", PROC_DIR), ("sysfs", SYS_DIR)] {
        let spec = MountSpec::virtual_fs(fstype, env.paths.resolve(dir));
        partitions::mount_filesystem(env, &spec).map_err(|e| {
            error!(error = %e, "initial mount failed");
            fail(format!("Could not mount initial {dir}."))
        })?;
    }

    // Later mounts by the guest init shadow these.
    for dir in [DEV_DIR, VAR_DIR] {
        partitions::mount_tmpfs(env, &env.paths.resolve(dir), STAGING_TMPFS_OPTIONS).map_err(
            |e| {
                error!(error = %e, "staging tmpfs mount failed");
                fail("tmpfs mount failed.")
            },
        )?;
    }

    devices::create_char_devices(env, &env.config.char_devices)?;
    devices::create_block_devices(env)?;

    ctx.nested_vm = devices::detect_nested_vm(env);
    info!(nested_vm = ctx.nested_vm, "detected boot mode");

    mount_default_system(env, ctx.nested_vm)?;

    let library_path = env.config.library_search_path();
    env.kernel.set_env(LIBRARY_PATH_VAR, &library_path);

    let data_dir = env.paths.resolve(DATA_DIR);
    fsutil::prepare_dir(&data_dir, 0o755).map_err(|e| {
        error!(path = %data_dir.display(), error = %e, "failed to create data dir");
        fail("Could not create /data folder.")
    })?;

    if env.config.init_property_area {
        let area = env.paths.resolve(PROPERTY_AREA);
        property_area::initialize(&area).map_err(|e| {
            error!(path = %area.display(), error = %e, "failed to initialize property area");
            fail("Could not initialize property area.")
        })?;
    }

    Ok(())
}

fn mount_default_system(env: BootEnv<'_>, nested_vm: bool) -> StageResult {
    let boot = BootPartitionMount::new(env, nested_vm);
    if !boot.is_success() {
        return Err(fail("Could not mount multiboot /boot partition."));
    }
    let table = env
        .paths
        .resolve(BOOT_TARGETS_DIR)
        .join(DEFAULT_TARGET)
        .join("partitions");
    partitions::mount_system_partition(env, nested_vm, &table, env.paths.resolve(SYSTEM_DIR))
        .map_err(|_| fail("Could not mount multiboot /system partition."))
}
