//! Customization of the assembled target from metadata and the system image.

use tracing::{error, info, warn};

use crate::binding;
use crate::config::BootConfig;
use crate::context::{BootContext, BootEnv, DeviceClass, Namespace};
use crate::display::DisplayProperties;
use crate::error::{Stage, StageError, StageResult};
use crate::fsutil;
use crate::metadata::{MetadataReader, keys};
use crate::network::NetworkCoordinator;
use crate::paths::{INITIAL_METADATA, target};
use crate::properties;

/// Mode of the generated init scripts.
pub const ARTIFACT_MODE: u32 = 0o650;
const FSTAB_MODE: u32 = 0o640;
const NESTED_MARKER_MODE: u32 = 0o444;

/// Property that is only set on images with a radio interface.
pub const RADIO_LIBRARY_PROPERTY: &str = "rild.libpath";

fn fail(cause: impl Into<String>) -> StageError {
    StageError::new(Stage::ApplyCustomization, cause)
}

/// Init script that publishes the display geometry as system properties.
pub fn metadata_properties(display: &DisplayProperties) -> String {
    format!(
        "on early-init\n  setprop ro.sf.lcd_density {}\n  setprop ro.hw.headless.display {}\n",
        display.dpi,
        display.config()
    )
}

/// fstab for nested VMs, whose data and cache disks are fixed.
pub fn nested_fstab(config: &BootConfig) -> String {
    let line = |device: &str, mount_point: &str| {
        format!("{device} {mount_point} ext4 nodev,noatime,nosuid,errors=panic wait\n")
    };
    line(&config.nested_data_device, "/data") + &line(&config.nested_cache_device, "/cache")
}

pub fn classify_device(props: &std::collections::HashMap<String, String>) -> DeviceClass {
    match props.get(RADIO_LIBRARY_PROPERTY) {
        Some(lib) if !lib.is_empty() => DeviceClass::Cellular,
        _ => DeviceClass::Wifi,
    }
}

pub fn apply_customization(
    env: BootEnv<'_>,
    ctx: &mut BootContext,
    reader: &MetadataReader,
    net: &mut NetworkCoordinator,
) -> StageResult {
    ctx.require_namespace(Namespace::Guest, Stage::ApplyCustomization)?;

    let build_prop = env.paths.target(target::BUILD_PROP);
    let props = properties::load_property_file(&build_prop).map_err(|e| {
        error!(error = %e, "failed to load build properties");
        fail(format!(
            "Failed to load property file /target/{}.",
            target::BUILD_PROP
        ))
    })?;
    ctx.device_class = classify_device(&props);
    info!(device_class = ?ctx.device_class, "classified device");

    write_custom_init(env, reader);
    write_metadata_properties(env, reader);
    binding::bind_files(env, reader);

    if ctx.device_class == DeviceClass::Cellular {
        net.configure_mobile(ctx)?;
    }

    if ctx.nested_vm {
        write_nested_storage(env);
    } else {
        run_mount_handler(env)?;
    }

    let from = env.paths.resolve(INITIAL_METADATA);
    let to = env.paths.target(target::INITIAL_METADATA);
    if let Err(e) = fsutil::copy_file(&from, &to) {
        warn!(from = %from.display(), to = %to.display(), error = %e, "failed to copy initial metadata");
    }
    Ok(())
}

fn write_custom_init(env: BootEnv<'_>, reader: &MetadataReader) {
    let contents = reader.get(keys::CUSTOM_INIT).unwrap_or_default();
    let path = env.paths.target(target::CUSTOM_INIT);
    match fsutil::write_artifact(&path, contents.as_bytes(), ARTIFACT_MODE) {
        Ok(()) => info!(path = %path.display(), bytes = contents.len(), "wrote custom init"),
        Err(e) => error!(path = %path.display(), error = %e, "could not create custom init file"),
    }
}

fn write_metadata_properties(env: BootEnv<'_>, reader: &MetadataReader) {
    let display = match reader.get(keys::DISPLAY) {
        None => {
            warn!("no display configuration specified, using defaults");
            DisplayProperties::default()
        }
        Some(value) => DisplayProperties::parse(value).unwrap_or_else(|| {
            warn!(value, "bad display value ignored, using defaults");
            DisplayProperties::default()
        }),
    };

    let path = env.paths.target(target::METADATA_PROPERTIES);
    let contents = metadata_properties(&display);
    match fsutil::write_artifact(&path, contents.as_bytes(), ARTIFACT_MODE) {
        Ok(()) => {
            let display_properties = &display;
            info!(path = %path.display(), display = %display_properties, "wrote metadata properties")
        }
        Err(e) => error!(path = %path.display(), error = %e, "could not create metadata properties file"),
    }
}

fn write_nested_storage(env: BootEnv<'_>) {
    let fstab = env.paths.target(target::NESTED_FSTAB);
    if let Err(e) = fsutil::write_artifact(&fstab, nested_fstab(env.config).as_bytes(), FSTAB_MODE) {
        error!(path = %fstab.display(), error = %e, "failed to write nested fstab");
    }
    let marker = env.paths.target(target::NESTED_MARKER);
    if let Err(e) = fsutil::touch(&marker, NESTED_MARKER_MODE) {
        error!(path = %marker.display(), error = %e, "failed to create nested marker");
    }
}

/// Runs the external mount handler before the system partitions are
/// switched.
fn run_mount_handler(env: BootEnv<'_>) -> StageResult {
    let handler = env.paths.resolve(&env.config.mount_handler);
    info!(handler = %handler.display(), "launching mount handler");
    let status = env.processes.run(&handler).map_err(|e| {
        error!(handler = %handler.display(), error = %e, "mount handler failed to start");
        fail("Could not start mount handler.")
    })?;
    if !status.success() {
        error!(handler = %handler.display(), %status, "mount handler failed");
        return Err(fail(format!("Mount handler exited with {status}.")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Event, FakeNetworkFactory, Harness, NetworkCall, RunOutcome};
    use boot_net::NetworkConfig;
    use std::collections::HashMap;
    use std::os::unix::fs::PermissionsExt;

    fn setup(h: &Harness, factory: &FakeNetworkFactory, nested_vm: bool) -> (NetworkCoordinator, BootContext) {
        let mut net = NetworkCoordinator::create(factory, &NetworkConfig::default())
            .ok()
            .unwrap();
        let mut ctx = BootContext {
            nested_vm,
            ..BootContext::default()
        };
        net.create_namespaces().unwrap();
        net.pivot(&mut ctx, Namespace::Guest).unwrap();
        h.mkdir("/target/system");
        (net, ctx)
    }

    fn mode_of(h: &Harness, path: &str) -> u32 {
        std::fs::metadata(h.paths.resolve(path))
            .unwrap()
            .permissions()
            .mode()
            & 0o7777
    }

    #[test]
    fn radio_library_selects_cellular() {
        let mut props = HashMap::new();
        assert_eq!(classify_device(&props), DeviceClass::Wifi);
        props.insert(RADIO_LIBRARY_PROPERTY.to_string(), String::new());
        assert_eq!(classify_device(&props), DeviceClass::Wifi);
        props.insert(RADIO_LIBRARY_PROPERTY.to_string(), "/system/lib/libril.so".into());
        assert_eq!(classify_device(&props), DeviceClass::Cellular);
    }

    #[test]
    fn properties_script_format() {
        let display = DisplayProperties::parse("1080x1920x32x480").unwrap();
        assert_eq!(
            metadata_properties(&display),
            "on early-init\n  setprop ro.sf.lcd_density 480\n  setprop ro.hw.headless.display 1080x1920x32\n"
        );
    }

    #[test]
    fn missing_build_prop_is_fatal() {
        let h = Harness::new();
        let factory = FakeNetworkFactory::new(&h.journal);
        let (mut net, mut ctx) = setup(&h, &factory, false);

        let err = apply_customization(h.env(), &mut ctx, &MetadataReader::default(), &mut net)
            .unwrap_err();
        assert_eq!(
            err.cause,
            "Failed to load property file /target/system/build.prop."
        );
    }

    #[test]
    fn writes_artifacts_and_runs_mount_handler() {
        let h = Harness::new();
        let factory = FakeNetworkFactory::new(&h.journal);
        let (mut net, mut ctx) = setup(&h, &factory, false);
        h.write("/target/system/build.prop", "ro.build.id=X\n");
        h.write(INITIAL_METADATA, "{}");
        let reader: MetadataReader = [
            (keys::CUSTOM_INIT, "on boot\n  start x\n"),
            (keys::DISPLAY, "garbage"),
        ]
        .into_iter()
        .collect();

        apply_customization(h.env(), &mut ctx, &reader, &mut net).unwrap();

        assert_eq!(ctx.device_class, DeviceClass::Wifi);
        assert_eq!(h.read("/target/init.metadata.rc"), "on boot\n  start x\n");
        assert_eq!(mode_of(&h, "/target/init.metadata.rc"), 0o650);
        assert_eq!(
            h.read("/target/metadata_properties.rc"),
            metadata_properties(&DisplayProperties::default())
        );
        assert_eq!(mode_of(&h, "/target/metadata_properties.rc"), 0o650);
        assert_eq!(h.read("/target/initial.metadata"), "{}");
        assert!(h.journal.contains(&Event::Run(h.paths.resolve("/system/bin/mount_handler"))));
        assert!(!h.journal.contains(&Event::Network(NetworkCall::Mobile)));
        assert!(!h.exists("/target/fstab.virt"));
    }

    #[test]
    fn custom_init_is_empty_without_metadata() {
        let h = Harness::new();
        let factory = FakeNetworkFactory::new(&h.journal);
        let (mut net, mut ctx) = setup(&h, &factory, false);
        h.write("/target/system/build.prop", "");

        apply_customization(h.env(), &mut ctx, &MetadataReader::default(), &mut net).unwrap();
        assert_eq!(h.read("/target/init.metadata.rc"), "");
    }

    #[test]
    fn mount_handler_failures_are_fatal() {
        let h = Harness::new();
        let factory = FakeNetworkFactory::new(&h.journal);
        let (mut net, mut ctx) = setup(&h, &factory, false);
        h.write("/target/system/build.prop", "");
        let handler = h.paths.resolve("/system/bin/mount_handler");

        h.processes.set_outcome(&handler, RunOutcome::SpawnError);
        let err = apply_customization(h.env(), &mut ctx, &MetadataReader::default(), &mut net)
            .unwrap_err();
        assert_eq!(err.cause, "Could not start mount handler.");

        h.processes.set_outcome(&handler, RunOutcome::Exit(3));
        let err = apply_customization(h.env(), &mut ctx, &MetadataReader::default(), &mut net)
            .unwrap_err();
        assert_eq!(err.stage, Stage::ApplyCustomization);
        assert!(err.cause.starts_with("Mount handler exited with"));
    }

    #[test]
    fn mount_handler_path_is_configurable_and_exit_code_reported() {
        let mut h = Harness::new();
        h.config.mount_handler = "/vendor/bin/remount".into();
        let factory = FakeNetworkFactory::new(&h.journal);
        let (mut net, mut ctx) = setup(&h, &factory, false);
        h.write("/target/system/build.prop", "");
        let handler = h.paths.resolve("/vendor/bin/remount");

        apply_customization(h.env(), &mut ctx, &MetadataReader::default(), &mut net).unwrap();
        assert!(h.journal.contains(&Event::Run(handler.clone())));
        assert!(!h.journal.contains(&Event::Run(h.paths.resolve("/system/bin/mount_handler"))));

        h.write(INITIAL_METADATA, "{}");
        h.processes.set_outcome(&handler, RunOutcome::Exit(3));
        let err = apply_customization(h.env(), &mut ctx, &MetadataReader::default(), &mut net)
            .unwrap_err();
        assert_eq!(err.cause, "Mount handler exited with exit status: 3.");
        assert!(!h.exists("/target/initial.metadata"));
    }

    #[test]
    fn cellular_configures_mobile_network() {
        let h = Harness::new();
        let factory = FakeNetworkFactory::new(&h.journal);
        let (mut net, mut ctx) = setup(&h, &factory, false);
        h.write("/target/system/build.prop", "rild.libpath=/system/lib/libril.so\n");

        apply_customization(h.env(), &mut ctx, &MetadataReader::default(), &mut net).unwrap();

        assert_eq!(ctx.device_class, DeviceClass::Cellular);
        let mobile = h.journal.position(&Event::Network(NetworkCall::Mobile)).unwrap();
        let handler = h
            .journal
            .position(&Event::Run(h.paths.resolve("/system/bin/mount_handler")))
            .unwrap();
        assert!(mobile < handler);
    }

    #[test]
    fn mobile_network_failure_is_fatal() {
        let h = Harness::new();
        let factory = FakeNetworkFactory::new(&h.journal).failing_on(NetworkCall::Mobile);
        let (mut net, mut ctx) = setup(&h, &factory, false);
        h.write("/target/system/build.prop", "rild.libpath=/system/lib/libril.so\n");

        let err = apply_customization(h.env(), &mut ctx, &MetadataReader::default(), &mut net)
            .unwrap_err();
        assert_eq!(err.stage, Stage::ConfigureMobileNetwork);
    }

    #[test]
    fn nested_mode_writes_fstab_instead_of_running_handler() {
        let h = Harness::new();
        let factory = FakeNetworkFactory::new(&h.journal);
        let (mut net, mut ctx) = setup(&h, &factory, true);
        h.write("/target/system/build.prop", "");

        apply_customization(h.env(), &mut ctx, &MetadataReader::default(), &mut net).unwrap();

        assert_eq!(
            h.read("/target/fstab.virt"),
            "/dev/block/vdc /data ext4 nodev,noatime,nosuid,errors=panic wait\n\
             /dev/block/vdd /cache ext4 nodev,noatime,nosuid,errors=panic wait\n"
        );
        assert_eq!(mode_of(&h, "/target/fstab.virt"), 0o640);
        assert_eq!(mode_of(&h, "/target/ts_snap.txt"), 0o444);
        assert_eq!(h.read("/target/ts_snap.txt"), "");
        assert!(!h.journal.contains(&Event::Run(h.paths.resolve("/system/bin/mount_handler"))));
    }
}
