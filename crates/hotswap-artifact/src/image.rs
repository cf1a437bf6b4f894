//! Bootstrap image codec
//!
//! Layout (little-endian):
//!
//! ```text
//! magic          4 bytes  "HSWA"
//! format version u16
//! manifest len   u32
//! manifest       UTF-8 `Key: Value` lines
//! payload len    u32
//! payload        opaque agent argument bytes
//! digest         32 bytes, blake3 over everything before it
//! ```

use crate::hash::{ImageDigest, DIGEST_LEN};
use crate::manifest::{Manifest, ManifestError};

/// Leading magic bytes of every image
pub const IMAGE_MAGIC: [u8; 4] = *b"HSWA";

/// Image format version written by this crate
pub const IMAGE_FORMAT_VERSION: u16 = 1;

const HEADER_LEN: usize = IMAGE_MAGIC.len() + 2;

/// Decoded bootstrap image: manifest plus opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleImage {
    manifest: Manifest,
    payload: Vec<u8>,
}

impl ModuleImage {
    /// Create an image from its parts
    #[must_use]
    pub fn new(manifest: Manifest, payload: Vec<u8>) -> Self {
        Self { manifest, payload }
    }

    /// Manifest attributes
    #[inline]
    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Agent argument bytes
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize to the sealed wire layout
    ///
    /// # Errors
    /// Returns error if a section exceeds `u32::MAX` bytes
    pub fn encode(&self) -> Result<Vec<u8>, ImageError> {
        let manifest = self.manifest.render();
        let manifest_len = section_len("manifest", manifest.len())?;
        let payload_len = section_len("payload", self.payload.len())?;

        let mut out =
            Vec::with_capacity(HEADER_LEN + 8 + manifest.len() + self.payload.len() + DIGEST_LEN);
        out.extend_from_slice(&IMAGE_MAGIC);
        out.extend_from_slice(&IMAGE_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&manifest_len.to_le_bytes());
        out.extend_from_slice(manifest.as_bytes());
        out.extend_from_slice(&payload_len.to_le_bytes());
        out.extend_from_slice(&self.payload);
        let digest = ImageDigest::compute(&out);
        out.extend_from_slice(digest.as_bytes());
        Ok(out)
    }

    /// Parse and verify a sealed image
    ///
    /// # Errors
    /// Returns error on bad magic, unsupported version, truncated or
    /// oversized sections, trailing bytes, digest mismatch or a malformed
    /// manifest
    pub fn decode(bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() < HEADER_LEN + DIGEST_LEN {
            return Err(ImageError::Truncated);
        }
        let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
        if body[..4] != IMAGE_MAGIC {
            return Err(ImageError::BadMagic);
        }
        let version = u16::from_le_bytes([body[4], body[5]]);
        if version != IMAGE_FORMAT_VERSION {
            return Err(ImageError::UnsupportedVersion(version));
        }
        let expected = ImageDigest::compute(body);
        if expected.as_bytes().as_slice() != digest {
            return Err(ImageError::DigestMismatch);
        }

        let mut cursor = Cursor::new(&body[HEADER_LEN..]);
        let manifest_bytes = cursor.section()?;
        let payload = cursor.section()?.to_vec();
        if !cursor.is_empty() {
            return Err(ImageError::TrailingBytes);
        }

        let text = std::str::from_utf8(manifest_bytes).map_err(|_| ImageError::ManifestNotUtf8)?;
        let manifest = Manifest::parse(text)?;
        Ok(Self { manifest, payload })
    }
}

fn section_len(section: &'static str, len: usize) -> Result<u32, ImageError> {
    u32::try_from(len).map_err(|_| ImageError::SectionTooLarge { section, len })
}

struct Cursor<'a> {
    rest: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(rest: &'a [u8]) -> Self {
        Self { rest }
    }

    fn section(&mut self) -> Result<&'a [u8], ImageError> {
        if self.rest.len() < 4 {
            return Err(ImageError::Truncated);
        }
        let (len, rest) = self.rest.split_at(4);
        let len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize;
        if rest.len() < len {
            return Err(ImageError::Truncated);
        }
        let (section, rest) = rest.split_at(len);
        self.rest = rest;
        Ok(section)
    }

    fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }
}

/// Image codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    #[error("image is truncated")]
    Truncated,

    #[error("not a bootstrap image (bad magic)")]
    BadMagic,

    #[error("unsupported image format version {0}")]
    UnsupportedVersion(u16),

    #[error("image digest does not match its contents")]
    DigestMismatch,

    #[error("image has trailing bytes after the payload")]
    TrailingBytes,

    #[error("{section} section is too large ({len} bytes)")]
    SectionTooLarge { section: &'static str, len: usize },

    #[error("manifest is not valid UTF-8")]
    ManifestNotUtf8,

    #[error("malformed manifest: {0}")]
    Manifest(#[from] ManifestError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::keys;
    use pretty_assertions::assert_eq;

    fn sample() -> ModuleImage {
        let manifest = Manifest::new()
            .with(keys::AGENT_ENTRY, "hotswap.bootstrap/agent_main")
            .unwrap()
            .with(keys::CAN_REDEFINE_TYPES, "true")
            .unwrap();
        ModuleImage::new(manifest, b"verbose=1".to_vec())
    }

    #[test]
    fn decode_recovers_encoded_image() {
        let image = sample();
        let bytes = image.encode().unwrap();
        assert_eq!(&bytes[..4], b"HSWA");
        assert_eq!(ModuleImage::decode(&bytes).unwrap(), image);
    }

    #[test]
    fn decode_detects_flipped_byte() {
        let mut bytes = sample().encode().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x20;
        assert_eq!(ModuleImage::decode(&bytes), Err(ImageError::DigestMismatch));
    }

    #[test]
    fn decode_rejects_foreign_bytes() {
        assert_eq!(ModuleImage::decode(b"PK\x03\x04"), Err(ImageError::Truncated));
        let mut bytes = sample().encode().unwrap();
        bytes[0] = b'X';
        assert_eq!(ModuleImage::decode(&bytes), Err(ImageError::BadMagic));
    }

    #[test]
    fn decode_rejects_future_version() {
        let mut bytes = sample().encode().unwrap();
        bytes[4] = 9;
        assert_eq!(
            ModuleImage::decode(&bytes),
            Err(ImageError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn decode_rejects_lying_length_even_with_valid_digest() {
        // Reseal a body whose manifest length overruns the buffer.
        let mut body = sample().encode().unwrap();
        body.truncate(body.len() - DIGEST_LEN);
        body[6..10].copy_from_slice(&u32::MAX.to_le_bytes());
        let digest = ImageDigest::compute(&body);
        body.extend_from_slice(digest.as_bytes());
        assert_eq!(ModuleImage::decode(&body), Err(ImageError::Truncated));
    }

    #[test]
    fn empty_payload_is_allowed() {
        let image = ModuleImage::new(Manifest::new(), Vec::new());
        let decoded = ModuleImage::decode(&image.encode().unwrap()).unwrap();
        assert!(decoded.payload().is_empty());
        assert!(decoded.manifest().is_empty());
    }
}
