use std::path::{Path, PathBuf};
use std::time::Duration;

use boot_net::NetworkConfig;
use serde::{Deserialize, Serialize};

/// Optional override file inside the initramfs.
pub const CONFIG_PATH: &str = "/boot-init.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },
}

/// Character device created during bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceNodeSpec {
    pub path: PathBuf,
    pub major: u32,
    pub minor: u32,
    pub mode: u32,
}

impl DeviceNodeSpec {
    fn new(path: &str, major: u32, minor: u32, mode: u32) -> Self {
        Self {
            path: PathBuf::from(path),
            major,
            minor,
            mode,
        }
    }
}

/// Bind mount inside the target tree. Both paths are relative to `/target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindEntry {
    pub source: String,
    pub target: String,
}

/// Alternate implementation of a system component chosen through metadata.
///
/// `pattern` is a path relative to `/target` with two placeholders: `{lib}`
/// expands to the library directory for the build's word size and
/// `{variant}` to the variant suffix (empty for the default build).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantSpec {
    pub name: String,
    pub metadata_key: String,
    pub pattern: String,
}

impl VariantSpec {
    fn new(name: &str, metadata_key: &str, pattern: &str) -> Self {
        Self {
            name: name.into(),
            metadata_key: metadata_key.into(),
            pattern: pattern.into(),
        }
    }

    pub fn path(&self, suffix: &str) -> String {
        self.pattern
            .replace("{lib}", library_dir())
            .replace("{variant}", suffix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub url: String,
    pub header_name: String,
    pub header_value: String,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            url: "http://169.254.169.254/computeMetadata/v1/instance/attributes/?recursive=true"
                .into(),
            header_name: "Metadata-Flavor".into(),
            header_value: "Google".into(),
            poll_interval_ms: 100,
            request_timeout_ms: 1000,
        }
    }
}

impl MetadataConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Everything the boot pipeline treats as data rather than logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    /// Kernel command line token that selects nested-VM mode.
    pub nested_vm_marker: String,
    pub char_devices: Vec<DeviceNodeSpec>,
    /// Library search path entries; `{lib}` expands to `lib` or `lib64`.
    pub library_paths: Vec<String>,
    /// Lay out an empty system property area before any library loads.
    pub init_property_area: bool,
    /// Disk holding the multiboot partition and the system partitions.
    pub multiboot_device: String,
    pub multiboot_partition: u32,
    pub nested_system_device: String,
    pub nested_ramdisk_device: String,
    pub nested_data_device: String,
    pub nested_cache_device: String,
    /// Options of the `/target/ephemeral` tmpfs.
    pub ephemeral_options: String,
    pub metadata: MetadataConfig,
    pub bind_files: Vec<BindEntry>,
    pub variants: Vec<VariantSpec>,
    pub mount_handler: PathBuf,
    pub next_stage_init: PathBuf,
    pub emergency_shell: PathBuf,
    pub network: NetworkConfig,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            nested_vm_marker: "AVD_NESTED_VM".into(),
            char_devices: vec![
                DeviceNodeSpec::new("/dev/null", 1, 3, 0o666),
                DeviceNodeSpec::new("/dev/random", 1, 8, 0o666),
                DeviceNodeSpec::new("/dev/urandom", 1, 9, 0o666),
                DeviceNodeSpec::new("/dev/kmsg", 1, 11, 0o644),
                DeviceNodeSpec::new("/dev/loop-control", 10, 237, 0o600),
            ],
            library_paths: vec!["/system/{lib}/hw/".into(), "/vendor/{lib}/hw/".into()],
            init_property_area: true,
            multiboot_device: "/dev/block/sda".into(),
            multiboot_partition: 1,
            nested_system_device: "/dev/block/vdb".into(),
            nested_ramdisk_device: "/dev/block/vda".into(),
            nested_data_device: "/dev/block/vdc".into(),
            nested_cache_device: "/dev/block/vdd".into(),
            ephemeral_options: "size=86%".into(),
            metadata: MetadataConfig::default(),
            bind_files: Vec::new(),
            variants: vec![
                VariantSpec::new(
                    "radio interface library",
                    crate::metadata::keys::RADIO_VARIANT,
                    "system/{lib}/libvirtual-ril{variant}.so",
                ),
                VariantSpec::new(
                    "display composer",
                    crate::metadata::keys::COMPOSER_VARIANT,
                    "system/{lib}/hw/hwcomposer.vsoc{variant}.so",
                ),
                VariantSpec::new(
                    "remote terminal server",
                    crate::metadata::keys::REMOTE_TERMINAL_VARIANT,
                    "system/bin/vnc_server{variant}",
                ),
            ],
            mount_handler: PathBuf::from("/system/bin/mount_handler"),
            next_stage_init: PathBuf::from("/init"),
            emergency_shell: PathBuf::from("/system/bin/sh"),
            network: NetworkConfig::default(),
        }
    }
}

impl BootConfig {
    /// Loads overrides from `path`; a missing file yields the built-in defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml_ng::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Value for `LD_LIBRARY_PATH`.
    pub fn library_search_path(&self) -> String {
        self.library_paths
            .iter()
            .map(|p| p.replace("{lib}", library_dir()))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Library directory name for the build's word size.
pub fn library_dir() -> &'static str {
    if usize::BITS == 64 { "lib64" } else { "lib" }
}
