use std::fmt;

/// Pipeline stage that produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    Bootstrap,
    CreateManagers,
    CreateNamespaces,
    PivotNamespace,
    ConfigureNetwork,
    FetchMetadata,
    AssembleFilesystem,
    ApplyCustomization,
    ConfigureMobileNetwork,
    Teardown,
    Exec,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Config => "config",
            Stage::Bootstrap => "bootstrap",
            Stage::CreateManagers => "create_managers",
            Stage::CreateNamespaces => "create_namespaces",
            Stage::PivotNamespace => "pivot_namespace",
            Stage::ConfigureNetwork => "configure_network",
            Stage::FetchMetadata => "fetch_metadata",
            Stage::AssembleFilesystem => "assemble_filesystem",
            Stage::ApplyCustomization => "apply_customization",
            Stage::ConfigureMobileNetwork => "configure_mobile_network",
            Stage::Teardown => "teardown",
            Stage::Exec => "exec",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hard failure of a boot stage. The first one produced stops the pipeline.
///
/// Displays as the bare cause, which is what ends up on the console after
/// the failure banner.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{cause}")]
pub struct StageError {
    pub stage: Stage,
    pub cause: String,
}

impl StageError {
    pub fn new(stage: Stage, cause: impl Into<String>) -> Self {
        Self {
            stage,
            cause: cause.into(),
        }
    }
}

pub type StageResult<T = ()> = Result<T, StageError>;
