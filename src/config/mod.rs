//! Client configuration.
//!
//! Provides:
//! - `ClientConfig` with sensible defaults
//! - TOML/JSON file loading picked by extension
//! - line-delimited list loading (`lists`)

pub mod lists;

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::modules::proxy::ProxyPoolConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid toml config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid json config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported config format '{0}', expected .toml or .json")]
    UnsupportedFormat(String),
}

/// Settings shared by the session store, proxy pool and request executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Scheme + host used for `origin` and `referer`.
    pub origin: String,
    /// GET target used to derive the anti-forgery token for a new identity.
    pub token_endpoint: String,
    pub bearer_token: Option<String>,
    pub session_cookie_name: String,
    pub csrf_cookie_name: String,
    pub csrf_header_name: String,
    pub transaction_header_name: String,
    /// Applied to every request before identity headers and caller overrides.
    pub static_headers: Vec<(String, String)>,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub proxy: ProxyPoolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            origin: "https://x.com".into(),
            token_endpoint: "https://x.com/".into(),
            bearer_token: None,
            session_cookie_name: "auth_token".into(),
            csrf_cookie_name: "ct0".into(),
            csrf_header_name: "x-csrf-token".into(),
            transaction_header_name: "x-client-transaction-id".into(),
            static_headers: vec![
                ("user-agent".into(), format!("sessionwire/{}", crate::VERSION)),
                ("accept".into(), "*/*".into()),
                ("accept-language".into(), "en-US,en;q=0.9".into()),
            ],
            request_timeout: Duration::from_secs(30),
            max_retries: 2,
            proxy: ProxyPoolConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Loads a `.toml` or `.json` file; missing fields keep their defaults.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(toml::from_str(&raw)?),
            Some("json") => Ok(serde_json::from_str(&raw)?),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }
    }
}

/// Serde adapter storing a `Duration` as whole seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
