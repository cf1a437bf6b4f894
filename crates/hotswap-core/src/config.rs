//! Controller configuration

use crate::attacher::AttachConfig;
use hotswap_artifact::BuildConfig;
use hotswap_runtime::ConfigError;
use serde::Deserialize;

/// Controller configuration: `[build]` and `[attach]` tables
///
/// ```toml
/// [build]
/// temp_dir = "/var/tmp/hotswap"
///
/// [attach]
/// timeout_ms = 5000
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HotswapConfig {
    pub build: BuildConfig,
    pub attach: AttachConfig,
}

impl HotswapConfig {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden from the environment
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            build: BuildConfig::from_env(),
            attach: AttachConfig::from_env(),
        }
    }

    /// Parse from TOML; missing tables and keys take their defaults
    ///
    /// # Errors
    /// Returns error if the document is not valid TOML for this struct
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    #[must_use]
    pub fn with_build(mut self, build: BuildConfig) -> Self {
        self.build = build;
        self
    }

    #[must_use]
    pub fn with_attach(mut self, attach: AttachConfig) -> Self {
        self.attach = attach;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn parses_both_tables() {
        let config = HotswapConfig::from_toml_str(
            r#"
            [build]
            temp_dir = "/var/tmp/hotswap"

            [attach]
            timeout_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.build.temp_dir, Some(PathBuf::from("/var/tmp/hotswap")));
        assert_eq!(config.build.file_prefix, BuildConfig::default().file_prefix);
        assert_eq!(config.attach.timeout(), Some(Duration::from_secs(5)));
        assert!(config.attach.allow_self_attach);
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(HotswapConfig::from_toml_str("").unwrap(), HotswapConfig::default());
    }

    #[test]
    fn wrong_types_are_rejected() {
        assert!(HotswapConfig::from_toml_str("[attach]\ntimeout_ms = \"soon\"").is_err());
    }
}
