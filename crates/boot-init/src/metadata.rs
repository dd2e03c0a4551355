//! Boot metadata retrieval.
//!
//! The metadata server is only reachable from the guest namespace and may
//! not be up yet when the VM boots, so retrieval pivots into the guest
//! namespace and polls until a complete listing arrives.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::MetadataConfig;
use crate::context::{BootContext, BootEnv, Namespace};
use crate::error::{Stage, StageError, StageResult};
use crate::network::NetworkCoordinator;
use crate::paths::{DEFAULT_TARGET, INITIAL_METADATA};

/// Metadata attribute names.
pub mod keys {
    pub const OS_VERSION: &str = "os_version";
    pub const DISPLAY: &str = "display";
    pub const CUSTOM_INIT: &str = "custom_init";
    pub const SYSTEM_OVERLAY_DEVICE: &str = "system_overlay_device";
    pub const RADIO_VARIANT: &str = "radio_variant";
    pub const COMPOSER_VARIANT: &str = "composer_variant";
    pub const REMOTE_TERMINAL_VARIANT: &str = "remote_terminal_variant";
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata request failed: {0}")]
    Request(String),

    #[error("metadata listing is not a JSON object: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One blocking attempt to fetch the full metadata listing.
pub trait MetadataQuery {
    fn query(&mut self) -> Result<String, MetadataError>;
}

/// Fetches the recursive attribute listing over HTTP.
pub struct HttpMetadataQuery {
    agent: ureq::Agent,
    url: String,
    header_name: String,
    header_value: String,
}

impl HttpMetadataQuery {
    pub fn new(config: &MetadataConfig) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(config.request_timeout()))
            .build()
            .new_agent();
        Self {
            agent,
            url: config.url.clone(),
            header_name: config.header_name.clone(),
            header_value: config.header_value.clone(),
        }
    }
}

impl MetadataQuery for HttpMetadataQuery {
    fn query(&mut self) -> Result<String, MetadataError> {
        let response = self
            .agent
            .get(&self.url)
            .header(&self.header_name, &self.header_value)
            .call()
            .map_err(|e| MetadataError::Request(format!("{e} url={}", self.url)))?;
        response
            .into_body()
            .read_to_string()
            .map_err(|e| MetadataError::Request(e.to_string()))
    }
}

/// Read-only view of the metadata attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataReader {
    values: HashMap<String, String>,
}

impl MetadataReader {
    /// Parses a JSON object listing. Non-string values are not attributes
    /// and are dropped.
    pub fn parse(body: &str) -> Result<Self, MetadataError> {
        let raw: HashMap<String, serde_json::Value> = serde_json::from_str(body)?;
        let values = raw
            .into_iter()
            .filter_map(|(k, v)| match v {
                serde_json::Value::String(s) => Some((k, s)),
                _ => None,
            })
            .collect();
        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MetadataReader {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Queries until a parsable listing arrives. There is no attempt bound.
pub fn poll_until_ready(
    query: &mut dyn MetadataQuery,
    interval: Duration,
) -> (MetadataReader, String) {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        match query
            .query()
            .and_then(|body| MetadataReader::parse(&body).map(|reader| (reader, body)))
        {
            Ok(ready) => {
                info!(attempts = attempt, "metadata ready");
                return ready;
            }
            Err(e) => debug!(attempt, error = %e, "metadata not available yet"),
        }
        thread::sleep(interval);
    }
}

/// Retrieves the metadata from inside the guest namespace and returns to the
/// outer namespace. Records the OS version to boot in `ctx`.
pub fn fetch_metadata(
    env: BootEnv<'_>,
    net: &mut NetworkCoordinator,
    ctx: &mut BootContext,
    query: &mut dyn MetadataQuery,
) -> StageResult<MetadataReader> {
    net.pivot(ctx, Namespace::Guest).map_err(|_| {
        StageError::new(
            Stage::FetchMetadata,
            "Could not switch namespace to initiate metadata connection.",
        )
    })?;

    info!("waiting for initial metadata");
    let (reader, body) = poll_until_ready(query, env.config.metadata.poll_interval());

    let saved = env.paths.resolve(INITIAL_METADATA);
    if let Err(e) = std::fs::write(&saved, &body) {
        warn!(path = %saved.display(), error = %e, "failed to save initial metadata");
    }

    net.pivot(ctx, Namespace::Outer).map_err(|e| {
        error!(error = %e, "failed to return to outer namespace");
        StageError::new(
            Stage::FetchMetadata,
            "Could not switch namespace after initiating metadata connection.",
        )
    })?;

    ctx.os_version = reader
        .get(keys::OS_VERSION)
        .unwrap_or(DEFAULT_TARGET)
        .to_string();
    info!(os_version = %ctx.os_version, "selected boot target");
    Ok(reader)
}
