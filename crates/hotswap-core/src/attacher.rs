//! Attacher
//!
//! Controller side of the attach protocol: connects to the target's attach
//! socket, asks it to load a bootstrap artifact and waits for the
//! acknowledgment. One-shot; no retry.

use crate::locator::TargetProcess;
use hotswap_artifact::{BootstrapArtifact, ImageDigest};
use hotswap_runtime::{
    socket_path, ProtocolError, RejectCode, Request, Response, ENV_SOCKET_DIR, PROTOCOL_VERSION,
};
use serde::Deserialize;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Environment variable setting [`AttachConfig::timeout_ms`]
pub const ENV_ATTACH_TIMEOUT_MS: &str = "HOTSWAP_ATTACH_TIMEOUT_MS";

/// Attach settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AttachConfig {
    /// Directory holding target sockets; `None` uses the system temp dir
    pub socket_dir: Option<PathBuf>,
    /// I/O timeout for the exchange; `None` waits indefinitely
    pub timeout_ms: Option<u64>,
    /// Permit attaching to the calling process
    pub allow_self_attach: bool,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            socket_dir: None,
            timeout_ms: None,
            allow_self_attach: true,
        }
    }
}

impl AttachConfig {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `HOTSWAP_SOCKET_DIR` and `HOTSWAP_ATTACH_TIMEOUT_MS`
    ///
    /// An unparsable timeout is ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = std::env::var_os(ENV_SOCKET_DIR).filter(|v| !v.is_empty()) {
            config.socket_dir = Some(PathBuf::from(dir));
        }
        if let Ok(raw) = std::env::var(ENV_ATTACH_TIMEOUT_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.timeout_ms = Some(ms),
                _ => tracing::warn!(value = %raw, "ignoring invalid {}", ENV_ATTACH_TIMEOUT_MS),
            }
        }
        config
    }

    #[inline]
    #[must_use]
    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = Some(dir.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1));
        self
    }

    #[inline]
    #[must_use]
    pub fn with_self_attach(mut self, allow: bool) -> Self {
        self.allow_self_attach = allow;
        self
    }

    /// Configured timeout
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Socket directory with the temp-dir fallback applied
    #[must_use]
    pub fn resolved_socket_dir(&self) -> PathBuf {
        self.socket_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Target's acknowledgment of a completed load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachReceipt {
    pub pid: u32,
    pub agent_id: Option<String>,
    pub entry_point: String,
    pub capability_id: Uuid,
    pub digest: ImageDigest,
}

/// Attach errors
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("process {0} not found")]
    ProcessNotFound(u32),

    #[error("permission denied on {}", path.display())]
    PermissionDenied { path: PathBuf },

    #[error("attach channel {} unavailable: {source}", path.display())]
    ChannelUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("target rejected the artifact ({code:?}): {message}")]
    Rejected { code: RejectCode, message: String },

    #[error("attach timed out")]
    TimedOut,

    #[error("attaching to the calling process is disabled")]
    SelfAttachDisabled,

    #[error("target loaded image {found}, expected {expected}")]
    DigestMismatch {
        expected: ImageDigest,
        found: ImageDigest,
    },

    #[error("attach protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl AttachError {
    /// Whether a later attempt could succeed without changing the inputs
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TimedOut | Self::ChannelUnavailable { .. })
    }
}

/// Sends bootstrap artifacts to target processes
#[derive(Debug, Clone, Default)]
pub struct Attacher {
    config: AttachConfig,
}

impl Attacher {
    #[must_use]
    pub fn new(config: AttachConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &AttachConfig {
        &self.config
    }

    /// Ask `target` to load `artifact` and wait for its acknowledgment
    ///
    /// Returns once the artifact's entry point has run inside the target.
    ///
    /// # Errors
    /// See [`AttachError`]
    pub fn attach(
        &self,
        target: &TargetProcess,
        artifact: &BootstrapArtifact,
    ) -> Result<AttachReceipt, AttachError> {
        if target.is_self() && !self.config.allow_self_attach {
            return Err(AttachError::SelfAttachDisabled);
        }
        if !process_exists(target.pid()) {
            return Err(AttachError::ProcessNotFound(target.pid()));
        }

        let path = socket_path(&self.config.resolved_socket_dir(), target.pid());
        tracing::debug!(
            pid = target.pid(),
            socket = %path.display(),
            artifact = %artifact.path().display(),
            "attaching"
        );

        let request = Request::LoadAgent {
            protocol: PROTOCOL_VERSION,
            artifact: artifact.path().to_path_buf(),
        };
        let response = exchange(&path, &request, self.config.timeout())?;

        match response {
            Response::Loaded {
                agent_id,
                entry_point,
                capability_id,
                digest,
            } => {
                if digest != artifact.digest() {
                    return Err(AttachError::DigestMismatch {
                        expected: artifact.digest(),
                        found: digest,
                    });
                }
                tracing::info!(
                    pid = target.pid(),
                    entry = %entry_point,
                    capability = %capability_id,
                    "agent loaded in target"
                );
                Ok(AttachReceipt {
                    pid: target.pid(),
                    agent_id,
                    entry_point,
                    capability_id,
                    digest,
                })
            }
            Response::Rejected { code, message } => {
                tracing::warn!(pid = target.pid(), ?code, "target rejected artifact: {message}");
                Err(AttachError::Rejected { code, message })
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn process_exists(pid: u32) -> bool {
    std::path::Path::new("/proc").join(pid.to_string()).exists()
}

// Without procfs a dead target surfaces as an unavailable channel.
#[cfg(not(target_os = "linux"))]
fn process_exists(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn exchange(
    path: &std::path::Path,
    request: &Request,
    timeout: Option<Duration>,
) -> Result<Response, AttachError> {
    use std::os::unix::net::UnixStream;

    let stream = UnixStream::connect(path).map_err(|source| match source.kind() {
        io::ErrorKind::PermissionDenied => AttachError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => AttachError::ChannelUnavailable {
            path: path.to_path_buf(),
            source,
        },
    })?;
    stream.set_read_timeout(timeout).map_err(ProtocolError::Io)?;
    stream.set_write_timeout(timeout).map_err(ProtocolError::Io)?;

    let mut writer = &stream;
    hotswap_runtime::write_message(&mut writer, request).map_err(map_timeout)?;
    hotswap_runtime::read_message(&mut io::BufReader::new(&stream)).map_err(map_timeout)
}

#[cfg(not(unix))]
fn exchange(
    path: &std::path::Path,
    _request: &Request,
    _timeout: Option<Duration>,
) -> Result<Response, AttachError> {
    Err(AttachError::ChannelUnavailable {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::Unsupported, "Unix domain sockets unavailable"),
    })
}

#[cfg(unix)]
fn map_timeout(err: ProtocolError) -> AttachError {
    match err {
        ProtocolError::Io(e)
            if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
        {
            AttachError::TimedOut
        }
        other => AttachError::Protocol(other),
    }
}
