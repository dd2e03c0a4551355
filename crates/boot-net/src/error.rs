use crate::command::CommandError;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("unable to create {capability}: {detail}")]
    Capability {
        capability: &'static str,
        detail: String,
    },

    #[error("network namespaces already created")]
    AlreadyCreated,

    #[error("unknown network namespace: {0}")]
    UnknownNamespace(String),

    #[error("{context}: {source}")]
    Sys {
        context: String,
        #[source]
        source: nix::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Command(#[from] CommandError),
}

pub type Result<T> = std::result::Result<T, NetworkError>;
