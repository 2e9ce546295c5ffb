//! Line-delimited list files (identities, proxies).

use std::fs;
use std::path::Path;

use super::ConfigError;

/// Reads non-empty, non-comment lines, trimmed.
pub fn load_lines(path: impl AsRef<Path>) -> Result<Vec<String>, ConfigError> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(parse_lines(&raw))
}

pub fn parse_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
