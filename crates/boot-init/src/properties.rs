use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
#[error("failed to read property file {}: {source}", path.display())]
pub struct PropertyError {
    path: PathBuf,
    #[source]
    source: std::io::Error,
}

/// Parses `key=value` lines. Blank lines, comments and lines without `=`
/// are ignored; later assignments win.
pub fn parse_properties(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

pub fn load_property_file(path: &Path) -> Result<HashMap<String, String>, PropertyError> {
    let contents = std::fs::read_to_string(path).map_err(|source| PropertyError {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_properties(&contents))
}
