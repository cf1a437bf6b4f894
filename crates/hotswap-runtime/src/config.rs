//! Runtime configuration

use serde::Deserialize;
use std::path::PathBuf;

/// Environment variable overriding the attach socket directory
pub const ENV_SOCKET_DIR: &str = "HOTSWAP_SOCKET_DIR";

/// Default cap on artifact size accepted by the loader
pub const DEFAULT_MAX_ARTIFACT_BYTES: u64 = 1024 * 1024;

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory holding the attach socket; `None` uses the system temp dir
    pub socket_dir: Option<PathBuf>,
    /// Apply redefinition batches all-or-nothing
    pub batch_atomic_redefinition: bool,
    /// Largest artifact the loader reads
    pub max_artifact_bytes: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            socket_dir: None,
            batch_atomic_redefinition: true,
            max_artifact_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
        }
    }
}

impl RuntimeConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `HOTSWAP_SOCKET_DIR`
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = std::env::var_os(ENV_SOCKET_DIR).filter(|v| !v.is_empty()) {
            config.socket_dir = Some(PathBuf::from(dir));
        }
        config
    }

    /// Parse from TOML; missing keys take their defaults
    ///
    /// # Errors
    /// Returns error if the document is not valid TOML for this struct
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// With socket directory
    #[inline]
    #[must_use]
    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = Some(dir.into());
        self
    }

    /// With batch atomicity switched on or off
    #[inline]
    #[must_use]
    pub fn with_batch_atomic(mut self, atomic: bool) -> Self {
        self.batch_atomic_redefinition = atomic;
        self
    }

    /// With artifact size limit
    #[inline]
    #[must_use]
    pub fn with_max_artifact_bytes(mut self, max: u64) -> Self {
        self.max_artifact_bytes = max;
        self
    }

    /// Socket directory with the temp-dir fallback applied
    #[must_use]
    pub fn resolved_socket_dir(&self) -> PathBuf {
        self.socket_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),
}
