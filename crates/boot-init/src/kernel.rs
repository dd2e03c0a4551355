//! Process-wide kernel state the boot pipeline mutates.
//!
//! Everything that changes the mount table, the root directory or the
//! environment goes through [`Kernel`] so the pipeline can run against a
//! recording fake in tests.

use std::os::fd::RawFd;
use std::path::Path;

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::stat::{Mode, SFlag, makedev, mknod, umask};

/// Descriptors at or above this value are never swept.
pub const FD_LIMIT: RawFd = 1024;

pub trait Kernel {
    fn mount(
        &self,
        source: Option<&str>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()>;

    fn umount(&self, target: &Path, flags: MntFlags) -> nix::Result<()>;

    /// Creates a device node with the process umask cleared.
    fn mknod(&self, path: &Path, kind: SFlag, mode: u32, major: u32, minor: u32)
    -> nix::Result<()>;

    fn chdir(&self, path: &Path) -> nix::Result<()>;

    fn chroot(&self, path: &Path) -> nix::Result<()>;

    /// Marks every descriptor from `first` up to [`FD_LIMIT`] close-on-exec.
    fn mark_cloexec_from(&self, first: RawFd);

    fn set_env(&self, key: &str, value: &str);
}

/// The running kernel.
#[derive(Debug, Default)]
pub struct LinuxKernel;

impl Kernel for LinuxKernel {
    fn mount(
        &self,
        source: Option<&str>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()> {
        mount(source, target, fstype, flags, data)
    }

    fn umount(&self, target: &Path, flags: MntFlags) -> nix::Result<()> {
        umount2(target, flags)
    }

    fn mknod(
        &self,
        path: &Path,
        kind: SFlag,
        mode: u32,
        major: u32,
        minor: u32,
    ) -> nix::Result<()> {
        let previous = umask(Mode::empty());
        let result = mknod(
            path,
            kind,
            Mode::from_bits_truncate(mode),
            makedev(u64::from(major), u64::from(minor)),
        );
        umask(previous);
        result
    }

    fn chdir(&self, path: &Path) -> nix::Result<()> {
        nix::unistd::chdir(path)
    }

    fn chroot(&self, path: &Path) -> nix::Result<()> {
        nix::unistd::chroot(path)
    }

    fn mark_cloexec_from(&self, first: RawFd) {
        for fd in first..FD_LIMIT {
            // SAFETY: F_SETFD on a descriptor that is not open fails with
            // EBADF and has no other effect.
            unsafe {
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
    }

    fn set_env(&self, key: &str, value: &str) {
        // SAFETY: the boot orchestrator is single-threaded; no other thread
        // can be reading the environment.
        unsafe {
            std::env::set_var(key, value);
        }
    }
}
