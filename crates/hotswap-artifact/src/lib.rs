//! Hotswap Artifact
//!
//! Builds the bootstrap module that is injected into a live process to
//! capture its redefinition capability.
//!
//! # Core Concepts
//!
//! - [`ModuleBuilder`]: assembles an image and writes it to a scoped temp file
//! - [`BootstrapArtifact`]: the written file; deleted on drop
//! - [`ModuleImage`]: the sealed on-disk layout (manifest + payload + digest)
//! - [`Manifest`]: `Key: Value` attributes, including capability flags
//! - [`ImageDigest`]: 32-byte Blake3 digest sealing an image
//!
//! # Example
//!
//! ```rust,ignore
//! use hotswap_artifact::ModuleBuilder;
//!
//! let artifact = ModuleBuilder::bootstrap().build()?;
//! println!("wrote {} ({})", artifact.path().display(), artifact.digest());
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod builder;
mod hash;
mod image;
mod manifest;

pub use builder::{
    BootstrapArtifact, BuildConfig, BuildError, ModuleBuilder, ARTIFACT_SUFFIX,
    BOOTSTRAP_ENTRY_POINT, ENV_TMPDIR,
};
pub use hash::{DigestError, ImageDigest, DIGEST_LEN};
pub use image::{ImageError, ModuleImage, IMAGE_FORMAT_VERSION, IMAGE_MAGIC};
pub use manifest::{keys, CapabilityFlag, Manifest, ManifestError, MANIFEST_VERSION};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
