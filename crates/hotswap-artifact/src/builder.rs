//! Module builder
//!
//! Assembles a bootstrap image and writes it to a scoped temporary file the
//! target process can read. The file lives exactly as long as the returned
//! [`BootstrapArtifact`]: dropping the artifact deletes it, and a failed
//! build never leaves one behind.

use crate::hash::ImageDigest;
use crate::image::{ImageError, ModuleImage};
use crate::manifest::{keys, CapabilityFlag, Manifest, ManifestError, MANIFEST_VERSION};
use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

/// Entry point of the capability bootstrap stub
pub const BOOTSTRAP_ENTRY_POINT: &str = "hotswap.bootstrap/agent_main";

/// Environment variable overriding the artifact directory
pub const ENV_TMPDIR: &str = "HOTSWAP_TMPDIR";

/// File extension of written artifacts
pub const ARTIFACT_SUFFIX: &str = ".hsa";

/// Manifest keys only the builder writes
const RESERVED_KEYS: [&str; 5] = [
    keys::MANIFEST_VERSION,
    keys::AGENT_ENTRY,
    keys::AGENT_ID,
    keys::CREATED_BY,
    keys::CAN_REDEFINE_TYPES,
];

/// Where and how artifacts are written
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Directory for artifacts; `None` uses the system temp dir
    pub temp_dir: Option<PathBuf>,
    /// File name prefix
    pub file_prefix: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            file_prefix: "hotswap-agent-".to_string(),
        }
    }
}

impl BuildConfig {
    /// Default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `HOTSWAP_TMPDIR`
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = std::env::var_os(ENV_TMPDIR).filter(|v| !v.is_empty()) {
            config.temp_dir = Some(PathBuf::from(dir));
        }
        config
    }

    /// With explicit artifact directory
    #[inline]
    #[must_use]
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    fn resolved_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Builder for bootstrap artifacts
///
/// # Example
/// ```rust,ignore
/// let artifact = ModuleBuilder::bootstrap().build()?;
/// attacher.attach(&target, &artifact)?;
/// // artifact file is removed here
/// drop(artifact);
/// ```
#[derive(Debug, Clone)]
pub struct ModuleBuilder {
    entry_point: String,
    capabilities: Vec<CapabilityFlag>,
    extra: Vec<(String, String)>,
    payload: Vec<u8>,
    config: BuildConfig,
}

impl ModuleBuilder {
    /// Builder for an arbitrary entry point with no capability flags
    #[must_use]
    pub fn new(entry_point: impl Into<String>) -> Self {
        Self {
            entry_point: entry_point.into(),
            capabilities: Vec::new(),
            extra: Vec::new(),
            payload: Vec::new(),
            config: BuildConfig::default(),
        }
    }

    /// Builder for the capability bootstrap stub, flagged for redefinition
    #[must_use]
    pub fn bootstrap() -> Self {
        Self::new(BOOTSTRAP_ENTRY_POINT).capability(CapabilityFlag::CAN_REDEFINE)
    }

    /// Require a capability flag
    #[must_use]
    pub fn capability(mut self, flag: CapabilityFlag) -> Self {
        if !self.capabilities.contains(&flag) {
            self.capabilities.push(flag);
        }
        self
    }

    /// Add a free-form manifest attribute
    ///
    /// Keys the builder writes itself (version, entry point, agent id,
    /// producer and capability flags) are rejected at build time.
    #[must_use]
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    /// Opaque bytes carried in the image, not interpreted by the loader
    #[must_use]
    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Use a specific build configuration
    #[must_use]
    pub fn config(mut self, config: BuildConfig) -> Self {
        self.config = config;
        self
    }

    /// Assemble the in-memory image without touching the filesystem
    ///
    /// # Errors
    /// Returns error if any manifest attribute is invalid or overrides a key
    /// the builder owns
    pub fn image(&self, agent_id: Uuid) -> Result<ModuleImage, BuildError> {
        if let Some((key, _)) = self.extra.iter().find(|(k, _)| self.owns_key(k)) {
            return Err(BuildError::ReservedAttribute(key.clone()));
        }
        let mut manifest = Manifest::new()
            .with(keys::MANIFEST_VERSION, MANIFEST_VERSION)?
            .with(keys::AGENT_ENTRY, self.entry_point.as_str())?
            .with(keys::AGENT_ID, agent_id.to_string())?
            .with(
                keys::CREATED_BY,
                format!("hotswap-artifact {}", crate::VERSION),
            )?;
        for flag in &self.capabilities {
            manifest.insert(flag.key, flag.value)?;
        }
        for (k, v) in &self.extra {
            manifest.insert(k.as_str(), v.as_str())?;
        }
        Ok(ModuleImage::new(manifest, self.payload.clone()))
    }

    fn owns_key(&self, key: &str) -> bool {
        RESERVED_KEYS.contains(&key) || self.capabilities.iter().any(|flag| flag.key == key)
    }

    /// Serialize the image and write it to a fresh temporary file
    ///
    /// # Errors
    /// - [`BuildError::Manifest`] / [`BuildError::Image`] if serialization fails
    /// - [`BuildError::TempFile`] / [`BuildError::Write`] if the directory is
    ///   not writable
    pub fn build(&self) -> Result<BootstrapArtifact, BuildError> {
        let agent_id = Uuid::new_v4();
        let bytes = self.image(agent_id)?.encode()?;
        let digest = ImageDigest::compute(&bytes);

        let dir = self.config.resolved_dir();
        let mut file = tempfile::Builder::new()
            .prefix(&self.config.file_prefix)
            .suffix(ARTIFACT_SUFFIX)
            .tempfile_in(&dir)
            .map_err(|source| BuildError::TempFile {
                dir: dir.clone(),
                source,
            })?;

        // `file` is removed on drop if either write fails.
        file.write_all(&bytes)
            .and_then(|()| file.flush())
            .map_err(|source| BuildError::Write {
                path: file.path().to_path_buf(),
                source,
            })?;

        tracing::debug!(
            path = %file.path().display(),
            entry = %self.entry_point,
            digest = %digest.short(),
            "bootstrap artifact written"
        );

        Ok(BootstrapArtifact {
            file,
            digest,
            agent_id,
            entry_point: self.entry_point.clone(),
            len: bytes.len(),
        })
    }
}

/// A serialized bootstrap module on disk
///
/// Deleting the file is best-effort and happens on drop; the target only
/// needs the file until its loader acknowledges the load.
#[derive(Debug)]
pub struct BootstrapArtifact {
    file: NamedTempFile,
    digest: ImageDigest,
    agent_id: Uuid,
    entry_point: String,
    len: usize,
}

impl BootstrapArtifact {
    /// Path the target process loads from
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Digest of the written image
    #[inline]
    #[must_use]
    pub fn digest(&self) -> ImageDigest {
        self.digest
    }

    /// Unique id recorded in the manifest
    #[inline]
    #[must_use]
    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    /// Entry point recorded in the manifest
    #[inline]
    #[must_use]
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Image size in bytes
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false: an image has at least a header and digest
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Delete the file now, reporting any I/O error
    ///
    /// # Errors
    /// Returns error if the file could not be removed
    pub fn remove(self) -> std::io::Result<()> {
        self.file.close()
    }
}

/// Artifact construction errors
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid manifest: {0}")]
    Manifest(#[from] ManifestError),

    #[error("attribute {0} is written by the builder")]
    ReservedAttribute(String),

    #[error("cannot serialize image: {0}")]
    Image(#[from] ImageError),

    #[error("cannot create artifact in {}: {source}", dir.display())]
    TempFile {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write artifact {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
