//! Error types for the hotswap controller

use crate::attacher::AttachError;
use crate::executor::RedefinitionError;
use crate::locator::LocatorError;
use hotswap_artifact::BuildError;
use hotswap_runtime::ConfigError;

/// Any controller-side failure
#[derive(Debug, thiserror::Error)]
pub enum HotswapError {
    /// Bootstrap artifact could not be written
    #[error("build failed: {0}")]
    Build(#[from] BuildError),

    /// Target process could not be resolved
    #[error("locate failed: {0}")]
    Locate(#[from] LocatorError),

    /// Artifact could not be delivered or was rejected
    #[error("attach failed: {0}")]
    Attach(#[from] AttachError),

    /// Own attach listener could not be started
    #[error("attach listener unavailable: {0}")]
    Listener(#[source] std::io::Error),

    /// Batch was not applied
    #[error("redefinition failed: {0}")]
    Redefinition(#[from] RedefinitionError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl HotswapError {
    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Attach(e) => e.is_transient(),
            Self::Redefinition(e) => e.is_retryable(),
            _ => false,
        }
    }
}
