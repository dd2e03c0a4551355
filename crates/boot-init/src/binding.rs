//! Bind mounts inside the target tree and component variant selection.

use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use tracing::{error, info, warn};

use crate::config::VariantSpec;
use crate::context::BootEnv;
use crate::fsutil::{self, NodeKind};
use crate::metadata::MetadataReader;

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("could not find bind source {}: {source}", path.display())]
    MissingSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not find bind target {}: {source}", path.display())]
    MissingTarget {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bind types do not match: {} is a {source_kind:?}, {} is a {target_kind:?}", source_path.display(), target_path.display())]
    KindMismatch {
        source_path: PathBuf,
        source_kind: NodeKind,
        target_path: PathBuf,
        target_kind: NodeKind,
    },

    #[error("could not bind {} to {}: {errno}", source_path.display(), target_path.display())]
    Mount {
        source_path: PathBuf,
        target_path: PathBuf,
        errno: nix::Error,
    },
}

/// Bind-mounts `source` over `target`. Both must exist and be of the same
/// kind (file over file, directory over directory).
pub fn bind(env: BootEnv<'_>, source: &Path, target: &Path) -> Result<(), BindError> {
    let source_kind = fsutil::node_kind(source).map_err(|e| BindError::MissingSource {
        path: source.to_path_buf(),
        source: e,
    })?;
    let target_kind = fsutil::node_kind(target).map_err(|e| BindError::MissingTarget {
        path: target.to_path_buf(),
        source: e,
    })?;
    if source_kind != target_kind {
        return Err(BindError::KindMismatch {
            source_path: source.to_path_buf(),
            source_kind,
            target_path: target.to_path_buf(),
            target_kind,
        });
    }

    let source_str = source.to_string_lossy();
    env.kernel
        .mount(Some(&*source_str), target, None, MsFlags::MS_BIND, None)
        .map_err(|errno| BindError::Mount {
            source_path: source.to_path_buf(),
            target_path: target.to_path_buf(),
            errno,
        })?;
    info!(source = %source.display(), target = %target.display(), "bound");
    Ok(())
}

/// Alternate builds a component can be switched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Default,
    Testing,
    Deprecated,
}

impl Variant {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DEFAULT" => Some(Variant::Default),
            "TESTING" => Some(Variant::Testing),
            "DEPRECATED" => Some(Variant::Deprecated),
            _ => None,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Variant::Default => "",
            Variant::Testing => "-testing",
            Variant::Deprecated => "-deprecated",
        }
    }
}

/// Binds the requested variant of `spec` over its default build.
///
/// Returns `Ok(true)` when a bind happened and `Ok(false)` when the setting
/// was absent, `DEFAULT`, invalid or not applicable to this image.
pub fn select_variant(
    env: BootEnv<'_>,
    spec: &VariantSpec,
    requested: Option<&str>,
) -> Result<bool, BindError> {
    let Some(requested) = requested else {
        return Ok(false);
    };

    let default_path = env.paths.target(spec.path(""));
    if !default_path.exists() {
        warn!(component = %spec.name, variant = requested, "ignoring variant setting: not applicable");
        return Ok(false);
    }

    let variant = match Variant::parse(requested) {
        Some(Variant::Default) => return Ok(false),
        Some(variant) => variant,
        None => {
            warn!(component = %spec.name, variant = requested, "variant not valid, using default");
            return Ok(false);
        }
    };

    let selected_path = env.paths.target(spec.path(variant.suffix()));
    if !selected_path.exists() {
        warn!(component = %spec.name, variant = requested, "ignoring variant setting: not available");
        return Ok(false);
    }

    info!(component = %spec.name, variant = requested, "switching variant");
    bind(env, &selected_path, &default_path)?;
    Ok(true)
}

/// Applies the configured bind entries and the metadata-selected variants.
/// Failures are logged and never stop the boot.
pub fn bind_files(env: BootEnv<'_>, reader: &MetadataReader) {
    for entry in &env.config.bind_files {
        let source = env.paths.target(entry.source.trim_start_matches('/'));
        let target = env.paths.target(entry.target.trim_start_matches('/'));
        if let Err(e) = bind(env, &source, &target) {
            error!(error = %e, "bind failed");
        }
    }

    for spec in &env.config.variants {
        if let Err(e) = select_variant(env, spec, reader.get(&spec.metadata_key)) {
            error!(component = %spec.name, error = %e, "variant bind failed");
        }
    }
}
