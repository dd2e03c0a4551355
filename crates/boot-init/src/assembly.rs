//! Target root filesystem assembly.

use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use tracing::{error, info, warn};

use crate::boot_mount::BootPartitionMount;
use crate::context::{BootContext, BootEnv, Namespace};
use crate::error::{Stage, StageError, StageResult};
use crate::fsutil;
use crate::metadata::{MetadataReader, keys};
use crate::partitions::{self, MountSpec, PARTITION_FLAGS};
use crate::paths::{LOWER_SYSTEM_DIR, TARGET_DIR, TARGET_STAGING_DIR, UPPER_SYSTEM_DIR, target};
use crate::ramdisk;

fn fail(cause: impl Into<String>) -> StageError {
    StageError::new(Stage::AssembleFilesystem, cause)
}

fn create_dir(path: &Path, label: &str) -> StageResult {
    fsutil::prepare_dir(path, 0o755).map_err(|e| {
        error!(path = %path.display(), error = %e, "failed to create directory");
        fail(format!("Could not create {label} folder."))
    })
}

/// Builds `/target`: skeleton directories, the ephemeral tmpfs, the unpacked
/// ramdisk and the system partition.
pub fn init_target_filesystem(
    env: BootEnv<'_>,
    ctx: &BootContext,
    reader: &MetadataReader,
) -> StageResult {
    ctx.require_namespace(Namespace::Guest, Stage::AssembleFilesystem)?;

    // `/target` is a bind mount so it can later be moved onto `/`.
    let staging = env.paths.resolve(TARGET_STAGING_DIR);
    let root = env.paths.resolve(TARGET_DIR);
    create_dir(&staging, TARGET_STAGING_DIR)?;
    create_dir(&root, TARGET_DIR)?;
    let staging_source = staging.to_string_lossy();
    env.kernel
        .mount(Some(&*staging_source), &root, None, MsFlags::MS_BIND, None)
        .map_err(|e| {
            error!(error = %e, "failed to bind target root");
            fail(format!("Could not mount {TARGET_STAGING_DIR}."))
        })?;

    for dir in [
        target::BOOT,
        target::SYSTEM,
        target::PROC,
        target::SYS,
        target::VAR,
        target::EPHEMERAL,
    ] {
        create_dir(&env.paths.target(dir), &format!("{TARGET_DIR}/{dir}"))?;
    }

    partitions::mount_tmpfs(
        env,
        &env.paths.target(target::EPHEMERAL),
        &env.config.ephemeral_options,
    )
    .map_err(|e| {
        error!(error = %e, "ephemeral tmpfs mount failed");
        fail("tmpfs mount failed.")
    })?;

    unpack_boot_target(env, ctx)?;

    if !mount_system_overlay(env, reader, ctx.nested_vm) {
        partitions::mount_system_partition(
            env,
            ctx.nested_vm,
            &env.paths.target(target::PARTITIONS),
            env.paths.target(target::SYSTEM),
        )
        .map_err(|_| fail(format!("Unable to mount {TARGET_DIR}/{}.", target::SYSTEM)))?;
    }
    Ok(())
}

/// Unpacks the ramdisk for the selected OS version into the target root and
/// places its partition listing next to it. Both are best-effort.
fn unpack_boot_target(env: BootEnv<'_>, ctx: &BootContext) -> StageResult {
    let boot = BootPartitionMount::new(env, ctx.nested_vm);
    if !boot.is_success() {
        return Err(fail("Could not mount multiboot /boot partition."));
    }

    let root = env.paths.resolve(TARGET_DIR);
    let image = if ctx.nested_vm {
        env.paths.resolve(&env.config.nested_ramdisk_device)
    } else {
        env.paths.boot_target_file(&ctx.os_version, "ramdisk")
    };
    match ramdisk::unpack_ramdisk(&image, &root) {
        Ok(entries) => info!(image = %image.display(), entries, "unpacked ramdisk"),
        Err(e) => error!(image = %image.display(), error = %e, "failed to unpack ramdisk"),
    }

    if !ctx.nested_vm {
        let listing = env.paths.boot_target_file(&ctx.os_version, "partitions");
        let dest = env.paths.target(target::PARTITIONS);
        if let Err(e) = fsutil::copy_file(&listing, &dest) {
            error!(from = %listing.display(), to = %dest.display(), error = %e, "failed to copy partition listing");
        }
    }
    Ok(())
}

/// Layers of the system overlay.
///
/// The composite is always mounted read-only. `upper` is only ever written
/// through a writable mount that remount tooling creates later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayDescriptor {
    /// Where the overlay device itself is mounted.
    pub upper_mount: PathBuf,
    pub upper: PathBuf,
    pub work: PathBuf,
    pub lower: PathBuf,
}

impl OverlayDescriptor {
    pub fn new(upper_mount: &Path, lower: &Path) -> Self {
        Self {
            upper_mount: upper_mount.to_path_buf(),
            upper: upper_mount.join("data"),
            work: upper_mount.join("work"),
            lower: lower.to_path_buf(),
        }
    }

    /// Source string of the overlay mount. The kernel ignores it; remount
    /// tooling reads the layer directories back from it.
    pub fn remount_hint(&self) -> String {
        format!(
            "uppermntpt={},upperdir={},workdir={},lowerdir={}",
            self.upper_mount.display(),
            self.upper.display(),
            self.work.display(),
            self.lower.display()
        )
    }

    /// Read-only mount options: the delta stacked over the base system.
    pub fn mount_options(&self) -> String {
        format!("lowerdir={}:{}", self.upper.display(), self.lower.display())
    }
}

/// Mounts the system partition as a read-only overlay over the device named
/// in metadata. Returns `true` only if the overlay is in place.
///
/// The upper filesystem is mounted read-only as well: a writable upper mount
/// would let anyone modify the composite through the upper mount point.
pub fn mount_system_overlay(env: BootEnv<'_>, reader: &MetadataReader, nested_vm: bool) -> bool {
    let Some(device) = reader.get(keys::SYSTEM_OVERLAY_DEVICE) else {
        info!("no system overlay device");
        return false;
    };

    let upper = env.paths.resolve(UPPER_SYSTEM_DIR);
    let lower = env.paths.resolve(LOWER_SYSTEM_DIR);

    let upper_spec = MountSpec::partition("ext4", device, 0, upper.clone());
    if let Err(e) = partitions::mount_filesystem(env, &upper_spec) {
        info!(device, error = %e, "could not mount overlay device");
        return false;
    }

    if let Err(e) = partitions::mount_system_partition(
        env,
        nested_vm,
        &env.paths.target(target::PARTITIONS),
        lower.clone(),
    ) {
        info!(error = %e, "could not mount lower system partition");
        return false;
    }

    let system = env.paths.target(target::SYSTEM);
    if let Err(e) = fsutil::prepare_dir(&system, 0o700) {
        warn!(path = %system.display(), error = %e, "failed to prepare overlay mount point");
    }

    let overlay = OverlayDescriptor::new(&upper, &lower);
    let hint = overlay.remount_hint();
    let options = overlay.mount_options();
    if let Err(e) = env.kernel.mount(
        Some(hint.as_str()),
        &system,
        Some("overlay"),
        PARTITION_FLAGS,
        Some(options.as_str()),
    ) {
        error!(error = %e, "overlay mount failed, falling back to base system");
        return false;
    }

    let system_rw = env.paths.target(target::SYSTEM_RW);
    if let Err(e) = fsutil::prepare_dir(&system_rw, 0o700) {
        error!(path = %system_rw.display(), error = %e, "failed to create writable system dir, remount will fail");
    }
    info!(device, "mounted system overlay");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramdisk::tests::build_ramdisk;
    use crate::testing::{Event, Harness, KernelCall};

    const LISTING: &str = "Number Start End Size Code Name\n 1 2048 4096 1M 8300 boot\n 2 4096 8192 2M 8300 system\n";

    fn guest_ctx(nested_vm: bool) -> BootContext {
        let mut ctx = BootContext {
            nested_vm,
            os_version: "9".into(),
            ..BootContext::default()
        };
        ctx.set_current_namespace(Namespace::Guest);
        ctx
    }

    fn with_boot_target(h: &Harness) {
        h.write(
            "/boot/targets/9/ramdisk",
            build_ramdisk(&[("init", 0o100750, b"#!init"), ("fstab.template", 0o100640, b"")]),
        );
        h.write("/boot/targets/9/partitions", LISTING);
    }

    #[test]
    fn requires_guest_namespace() {
        let h = Harness::new();
        let mut ctx = guest_ctx(false);
        ctx.set_current_namespace(Namespace::Outer);
        let err = init_target_filesystem(h.env(), &ctx, &MetadataReader::default()).unwrap_err();
        assert_eq!(err.stage, Stage::AssembleFilesystem);
        assert!(h.journal.mounts().is_empty());
    }

    #[test]
    fn assembles_target_from_boot_partition() {
        let h = Harness::new();
        with_boot_target(&h);

        init_target_filesystem(h.env(), &guest_ctx(false), &MetadataReader::default()).unwrap();

        let bind = h.journal.mount_at(&h.paths.resolve("/target")).unwrap();
        assert_eq!(bind.flags, MsFlags::MS_BIND);
        for dir in ["boot", "system", "proc", "sys", "var", "ephemeral"] {
            assert!(h.paths.target(dir).is_dir(), "{dir}");
        }
        let ephemeral = h.journal.mount_at(&h.paths.target("ephemeral")).unwrap();
        assert_eq!(ephemeral.data.as_deref(), Some("size=86%"));

        assert_eq!(h.read("/target/init"), "#!init");
        assert_eq!(h.read("/target/partitions"), LISTING);

        let system = h.journal.mount_at(&h.paths.target("system")).unwrap();
        assert_eq!(system.source.as_deref(), Some("/dev/block/sda2"));
        assert_eq!(system.flags, MsFlags::MS_RDONLY | MsFlags::MS_NODEV);
    }

    #[test]
    fn missing_ramdisk_is_not_fatal() {
        let h = Harness::new();
        h.write("/boot/targets/9/partitions", LISTING);

        init_target_filesystem(h.env(), &guest_ctx(false), &MetadataReader::default()).unwrap();
        assert!(!h.exists("/target/init"));
    }

    #[test]
    fn nested_mode_unpacks_ramdisk_device() {
        let h = Harness::new();
        h.write(
            "/dev/block/vda",
            build_ramdisk(&[("init", 0o100750, b"#!nested")]),
        );

        init_target_filesystem(h.env(), &guest_ctx(true), &MetadataReader::default()).unwrap();

        assert_eq!(h.read("/target/init"), "#!nested");
        assert!(h.journal.mount_at(&h.paths.resolve("/boot")).is_none());
        let system = h.journal.mount_at(&h.paths.target("system")).unwrap();
        assert_eq!(system.source.as_deref(), Some("/dev/block/vdb"));
    }

    #[test]
    fn unmountable_system_is_fatal() {
        let h = Harness::new();
        with_boot_target(&h);
        h.kernel.fail_mount_at(h.paths.target("system"));

        let err =
            init_target_filesystem(h.env(), &guest_ctx(false), &MetadataReader::default())
                .unwrap_err();
        assert_eq!(err.cause, "Unable to mount /target/system.");
    }

    #[test]
    fn overlay_absent_key_attempts_nothing() {
        let h = Harness::new();
        assert!(!mount_system_overlay(h.env(), &MetadataReader::default(), false));
        assert!(h.journal.events().is_empty());
    }

    #[test]
    fn overlay_is_read_only_with_remount_hint() {
        let h = Harness::new();
        h.write("/target/partitions", LISTING);
        let reader: MetadataReader = [(keys::SYSTEM_OVERLAY_DEVICE, "/dev/block/sdb")]
            .into_iter()
            .collect();

        assert!(mount_system_overlay(h.env(), &reader, false));

        let upper_dir = h.paths.resolve(UPPER_SYSTEM_DIR);
        let lower_dir = h.paths.resolve(LOWER_SYSTEM_DIR);
        let upper = h.journal.mount_at(&upper_dir).unwrap();
        assert_eq!(upper.source.as_deref(), Some("/dev/block/sdb"));
        assert!(upper.flags.contains(MsFlags::MS_RDONLY));

        let lower = h.journal.mount_at(&lower_dir).unwrap();
        assert_eq!(lower.source.as_deref(), Some("/dev/block/sda2"));

        let upper_dir = upper_dir.display().to_string();
        let lower_dir = lower_dir.display().to_string();
        let overlay = h.journal.mount_at(&h.paths.target("system")).unwrap();
        assert_eq!(overlay.fstype.as_deref(), Some("overlay"));
        assert_eq!(overlay.flags, MsFlags::MS_RDONLY | MsFlags::MS_NODEV);
        assert_eq!(
            overlay.source.unwrap(),
            format!(
                "uppermntpt={upper_dir},upperdir={upper_dir}/data,workdir={upper_dir}/work,lowerdir={lower_dir}"
            )
        );
        assert_eq!(
            overlay.data.unwrap(),
            format!("lowerdir={upper_dir}/data:{lower_dir}")
        );
        assert!(h.paths.target("system_rw").is_dir());
    }

    #[test]
    fn overlay_failure_falls_back_to_base_system() {
        let h = Harness::new();
        with_boot_target(&h);
        h.kernel.fail_mount_at(h.paths.resolve(UPPER_SYSTEM_DIR));
        let reader: MetadataReader = [(keys::SYSTEM_OVERLAY_DEVICE, "/dev/block/sdb")]
            .into_iter()
            .collect();

        init_target_filesystem(h.env(), &guest_ctx(false), &reader).unwrap();

        let system = h.journal.mount_at(&h.paths.target("system")).unwrap();
        assert_eq!(system.fstype.as_deref(), Some("ext4"));
        assert!(!h.paths.target("system_rw").exists());
        assert_eq!(
            h.journal.count(|e| matches!(e, Event::Kernel(KernelCall::Mount(m)) if m.fstype.as_deref() == Some("overlay"))),
            0
        );
    }

    #[test]
    fn lower_mount_failure_falls_back_to_base_system() {
        let h = Harness::new();
        with_boot_target(&h);
        h.kernel.fail_mount_at(h.paths.resolve(LOWER_SYSTEM_DIR));
        let reader: MetadataReader = [(keys::SYSTEM_OVERLAY_DEVICE, "/dev/block/sdb")]
            .into_iter()
            .collect();

        init_target_filesystem(h.env(), &guest_ctx(false), &reader).unwrap();

        assert!(h.journal.mount_at(&h.paths.resolve(UPPER_SYSTEM_DIR)).is_some());
        assert!(h.journal.mount_at(&h.paths.resolve(LOWER_SYSTEM_DIR)).is_none());
        let system = h.journal.mount_at(&h.paths.target("system")).unwrap();
        assert_eq!(system.source.as_deref(), Some("/dev/block/sda2"));
        assert_eq!(system.fstype.as_deref(), Some("ext4"));
        assert!(!h.paths.target("system_rw").exists());
    }
}
