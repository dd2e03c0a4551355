//! The boot pipeline and the emergency fallback.

use std::fs::OpenOptions;
use std::io::Write;

use tracing::{error, info, warn};

use crate::assembly;
use crate::bootstrap;
use crate::config::BootConfig;
use crate::context::{BootContext, BootEnv, Namespace};
use crate::customize;
use crate::error::{Stage, StageError, StageResult};
use crate::kernel::{Kernel, LinuxKernel};
use crate::metadata::{self, HttpMetadataQuery, MetadataQuery};
use crate::network::{NetworkCoordinator, NetworkFactory, StackFactory};
use crate::paths::{BootPaths, SELF_IMAGE, SELF_IMAGE_BACKUP, STAGE_LOG};
use crate::process::{ProcessControl, SystemProcesses};
use crate::teardown;
use crate::telemetry::StageRecorder;

/// Prefix of the line host tooling scans the console for.
pub const FAILURE_BANNER: &str = "VIRTUAL_DEVICE_BOOT_FAILED";

const KMSG: &str = "/dev/kmsg";
const KMSG_ERROR_LEVEL: &str = "<3>";

/// Boundaries of the pipeline that touch the outside world.
pub struct Platform {
    pub kernel: Box<dyn Kernel>,
    pub network: Box<dyn NetworkFactory>,
    pub metadata: Box<dyn MetadataQuery>,
    pub processes: Box<dyn ProcessControl>,
}

impl Platform {
    pub fn system(config: &BootConfig) -> Self {
        Self {
            kernel: Box::new(LinuxKernel),
            network: Box::new(StackFactory),
            metadata: Box::new(HttpMetadataQuery::new(&config.metadata)),
            processes: Box::new(SystemProcesses),
        }
    }
}

pub fn failure_banner(err: &StageError) -> String {
    format!("{FAILURE_BANNER} : {err}")
}

pub struct Orchestrator {
    config: BootConfig,
    paths: BootPaths,
    platform: Platform,
    recorder: StageRecorder,
}

impl Orchestrator {
    pub fn new(config: BootConfig, paths: BootPaths, platform: Platform) -> Self {
        let recorder = StageRecorder::new(paths.resolve(STAGE_LOG));
        Self {
            config,
            paths,
            platform,
            recorder,
        }
    }

    /// Runs every stage and replaces the process with the next-stage init.
    /// Only returns if the boot failed; the result is the first failure.
    pub fn boot(&mut self) -> StageError {
        if let Err(e) = self.run_stages() {
            return e;
        }

        let init = &self.config.next_stage_init;
        info!(init = %init.display(), "handing off to init");
        let err = self.platform.processes.exec(init);
        error!(init = %init.display(), error = %err, "exec failed");
        StageError::new(Stage::Exec, "Could not exec init.")
    }

    fn run_stages(&mut self) -> StageResult {
        let Self {
            config,
            paths,
            platform,
            recorder,
        } = self;
        let Platform {
            kernel,
            network,
            metadata: query,
            processes,
        } = platform;
        let (config, recorder) = (&*config, &*recorder);
        let env = BootEnv {
            config,
            paths,
            kernel: &**kernel,
            processes: &**processes,
        };
        let mut ctx = BootContext::default();

        recorder.timed(Stage::Bootstrap, || {
            bootstrap::initialize_min_environment(env, &mut ctx)
        })?;
        let mut net = recorder.timed(Stage::CreateManagers, || {
            NetworkCoordinator::create(&**network, &config.network)
        })?;
        recorder.timed(Stage::CreateNamespaces, || net.create_namespaces())?;
        recorder.timed(Stage::PivotNamespace, || {
            net.pivot(&mut ctx, Namespace::Outer)
        })?;
        recorder.timed(Stage::ConfigureNetwork, || {
            net.configure_common(env, &ctx)
        })?;

        // The target ramdisk brings its own init.
        rename_self_image(env);

        let reader = recorder.timed(Stage::FetchMetadata, || {
            metadata::fetch_metadata(env, &mut net, &mut ctx, &mut **query)
        })?;
        recorder.timed(Stage::PivotNamespace, || {
            net.pivot(&mut ctx, Namespace::Guest)
        })?;
        recorder.timed(Stage::AssembleFilesystem, || {
            assembly::init_target_filesystem(env, &ctx, &reader)
        })?;
        recorder.timed(Stage::ApplyCustomization, || {
            customize::apply_customization(env, &mut ctx, &reader, &mut net)
        })?;

        info!("pivoting to init");
        recorder.timed(Stage::Teardown, || teardown::clean_up(env))
    }

    /// Reports `err` on the kernel log and console, runs an interactive
    /// shell and parks the process.
    pub fn fallback(&self, err: &StageError) {
        error!(stage = %err.stage, cause = %err.cause, "boot failed");
        let banner = failure_banner(err);

        let kmsg = self.paths.resolve(KMSG);
        match OpenOptions::new().append(true).open(&kmsg) {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{KMSG_ERROR_LEVEL}{banner}") {
                    warn!(error = %e, "failed to write kernel log");
                }
            }
            Err(e) => warn!(error = %e, "kernel log unavailable"),
        }
        // The kernel log may not be set up yet; the console always is.
        println!("{banner}");

        let shell = self.paths.resolve(&self.config.emergency_shell);
        match self.platform.processes.run(&shell) {
            Ok(status) => info!(%status, "emergency shell exited"),
            Err(e) => error!(shell = %shell.display(), error = %e, "could not start emergency shell"),
        }
        self.platform.processes.suspend();
    }
}

fn rename_self_image(env: BootEnv<'_>) {
    let from = env.paths.resolve(SELF_IMAGE);
    let to = env.paths.resolve(SELF_IMAGE_BACKUP);
    if let Err(e) = std::fs::rename(&from, &to) {
        error!(from = %from.display(), to = %to.display(), error = %e, "failed to move own image");
    }
}
