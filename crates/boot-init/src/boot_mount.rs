use std::path::PathBuf;

use nix::mount::MntFlags;
use tracing::{debug, error, warn};

use crate::context::BootEnv;
use crate::paths::BOOT_DIR;
use crate::partitions::{MountSpec, mount_filesystem};

/// Keeps the multiboot partition mounted at `/boot` for the lifetime of the
/// guard and force-unmounts it on drop.
///
/// Nested VMs have no multiboot partition; the guard is then a no-op that
/// still reports success.
pub struct BootPartitionMount<'a> {
    env: BootEnv<'a>,
    target: PathBuf,
    nested_vm: bool,
    mounted: bool,
}

impl<'a> BootPartitionMount<'a> {
    pub fn new(env: BootEnv<'a>, nested_vm: bool) -> Self {
        let target = env.paths.resolve(BOOT_DIR);
        let mut mounted = false;
        if !nested_vm {
            let spec = MountSpec::partition(
                "ext4",
                &env.config.multiboot_device,
                env.config.multiboot_partition,
                target.clone(),
            );
            match mount_filesystem(env, &spec) {
                Ok(()) => {
                    debug!(device = ?spec.device(), "mounted boot partition");
                    mounted = true;
                }
                Err(e) => error!(error = %e, "failed to mount boot partition"),
            }
        }
        Self {
            env,
            target,
            nested_vm,
            mounted,
        }
    }

    pub fn is_success(&self) -> bool {
        self.mounted || self.nested_vm
    }
}

impl Drop for BootPartitionMount<'_> {
    fn drop(&mut self) {
        if self.nested_vm || !self.mounted {
            return;
        }
        if let Err(e) = self.env.kernel.umount(&self.target, MntFlags::MNT_FORCE) {
            warn!(path = %self.target.display(), error = %e, "failed to unmount boot partition");
        }
    }
}
