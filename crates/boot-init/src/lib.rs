//! Staged boot orchestrator for the guest's early userspace.
//!
//! Runs as PID 1 from the initramfs. The pipeline is strictly linear:
//!
//! 1. bootstrap: pseudo filesystems, staging tmpfs, device nodes
//! 2. network capabilities, namespaces, common network in the outer namespace
//! 3. metadata retrieval from inside the guest namespace
//! 4. target assembly: ramdisk, system partition or overlay
//! 5. customization: generated init scripts, variant binds, storage setup
//! 6. teardown: move the target onto `/` and chroot
//!
//! and ends by replacing the process image with the next-stage init. The
//! first failing stage stops the pipeline and drops into an emergency shell
//! ([`Orchestrator::fallback`]).

pub mod assembly;
pub mod binding;
pub mod boot_mount;
pub mod bootstrap;
pub mod config;
pub mod context;
pub mod customize;
pub mod devices;
pub mod display;
pub mod error;
pub mod fsutil;
pub mod kernel;
pub mod metadata;
pub mod network;
pub mod orchestrator;
pub mod partitions;
pub mod paths;
pub mod process;
pub mod properties;
pub mod property_area;
pub mod ramdisk;
pub mod teardown;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use config::BootConfig;
pub use error::{Stage, StageError, StageResult};
pub use orchestrator::{Orchestrator, Platform};
pub use paths::BootPaths;
