use std::path::Path;

use nix::mount::{MntFlags, MsFlags};
use tracing::{error, info};

use crate::context::BootEnv;
use crate::error::{Stage, StageError, StageResult};
use crate::paths::{DEV_DIR, PROC_DIR, SYS_DIR, SYSTEM_DIR, TARGET_DIR, VAR_DIR, target};

fn fail(cause: impl Into<String>) -> StageError {
    StageError::new(Stage::Teardown, cause)
}

/// Makes `/target` the root of the process: moves `/var` into it, drops the
/// bootstrap mounts, moves the target over `/` and chroots into it. Marks
/// every inherited descriptor close-on-exec.
pub fn clean_up(env: BootEnv<'_>) -> StageResult {
    // Every later step acts on the working directory.
    let root = env.paths.resolve(TARGET_DIR);
    env.kernel.chdir(&root).map_err(|e| {
        error!(path = %root.display(), error = %e, "chdir into target failed");
        fail(format!("Could not chdir to {TARGET_DIR}."))
    })?;

    let var = env.paths.resolve(VAR_DIR);
    let var_source = var.to_string_lossy();
    env.kernel
        .mount(
            Some(&*var_source),
            &env.paths.target(target::VAR),
            None,
            MsFlags::MS_MOVE,
            None,
        )
        .map_err(|e| {
            error!(error = %e, "failed to move /var");
            fail(format!("Could not move {VAR_DIR}."))
        })?;

    unmount(env, SYSTEM_DIR, MntFlags::empty())?;
    for dir in [PROC_DIR, SYS_DIR, DEV_DIR] {
        unmount(env, dir, MntFlags::MNT_DETACH)?;
    }

    let cwd = Path::new(".");
    env.kernel
        .mount(Some("."), &env.paths.resolve("/"), None, MsFlags::MS_MOVE, None)
        .map_err(|e| {
            error!(error = %e, "failed to move target over /");
            fail("Could not move /.")
        })?;
    env.kernel.chroot(cwd).map_err(|e| {
        error!(error = %e, "chroot failed");
        fail("Could not chroot.")
    })?;

    env.kernel.mark_cloexec_from(3);
    info!("pivoted into target root");
    Ok(())
}

fn unmount(env: BootEnv<'_>, dir: &str, flags: MntFlags) -> StageResult {
    let path = env.paths.resolve(dir);
    env.kernel.umount(&path, flags).map_err(|e| {
        error!(path = %path.display(), error = %e, "unmount failed");
        fail(format!("Could not unmount {dir}."))
    })
}
