//! Manifest attributes
//!
//! A bootstrap image carries a small manifest of `Key: Value` lines. The
//! loader in the target process reads it to find the entry point and the
//! capability flags the runtime must grant.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Manifest format version written by this crate
pub const MANIFEST_VERSION: &str = "1.0";

/// Well-known manifest keys
pub mod keys {
    /// Manifest format version
    pub const MANIFEST_VERSION: &str = "Manifest-Version";
    /// Name of the entry point the loader invokes
    pub const AGENT_ENTRY: &str = "Agent-Entry";
    /// Capability flag required before the runtime grants redefinition
    pub const CAN_REDEFINE_TYPES: &str = "Can-Redefine-Types";
    /// Unique id of this artifact instance
    pub const AGENT_ID: &str = "Agent-Id";
    /// Tool that produced the image
    pub const CREATED_BY: &str = "Created-By";
}

/// A required capability flag: a manifest key that must be present with a
/// specific value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapabilityFlag {
    pub key: &'static str,
    pub value: &'static str,
}

impl CapabilityFlag {
    /// The flag the runtime requires to permit type redefinition
    pub const CAN_REDEFINE: Self = Self {
        key: keys::CAN_REDEFINE_TYPES,
        value: "true",
    };

    /// Whether `manifest` declares this flag
    #[must_use]
    pub fn is_declared_by(&self, manifest: &Manifest) -> bool {
        manifest
            .get(self.key)
            .is_some_and(|v| v.eq_ignore_ascii_case(self.value))
    }
}

impl Display for CapabilityFlag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.value)
    }
}

/// Ordered set of manifest attributes
///
/// # Invariants
/// - Keys are non-empty and contain neither `:` nor line breaks
/// - Values contain no line breaks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    attributes: BTreeMap<String, String>,
}

impl Manifest {
    /// Empty manifest
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an attribute
    ///
    /// # Errors
    /// Returns error if the key or value would break the line format
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ManifestError> {
        let key = key.into();
        let value = value.into();
        validate_key(&key)?;
        if value.contains(['\n', '\r']) {
            return Err(ManifestError::InvalidValue { key });
        }
        self.attributes.insert(key, value);
        Ok(())
    }

    /// Builder-style [`Manifest::insert`]
    ///
    /// # Errors
    /// Same as [`Manifest::insert`]
    pub fn with(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, ManifestError> {
        self.insert(key, value)?;
        Ok(self)
    }

    /// Look up an attribute
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Look up an attribute that must be present
    ///
    /// # Errors
    /// Returns [`ManifestError::MissingKey`] when absent
    pub fn require(&self, key: &str) -> Result<&str, ManifestError> {
        self.get(key)
            .ok_or_else(|| ManifestError::MissingKey(key.to_string()))
    }

    /// Entry point named by the manifest
    ///
    /// # Errors
    /// Returns error if `Agent-Entry` is missing
    pub fn entry_point(&self) -> Result<&str, ManifestError> {
        self.require(keys::AGENT_ENTRY)
    }

    /// Iterate attributes in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of attributes
    #[must_use]
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Render as `Key: Value\n` lines in key order
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.attributes {
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push('\n');
        }
        out
    }

    /// Parse `Key: Value` lines
    ///
    /// Blank lines are ignored.
    ///
    /// # Errors
    /// Returns error on lines without a `": "` separator, invalid keys or
    /// duplicate keys
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut manifest = Self::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(": ")
                .ok_or(ManifestError::MalformedLine { line: idx + 1 })?;
            if manifest.attributes.contains_key(key) {
                return Err(ManifestError::DuplicateKey(key.to_string()));
            }
            manifest.insert(key, value)?;
        }
        Ok(manifest)
    }
}

fn validate_key(key: &str) -> Result<(), ManifestError> {
    if key.is_empty() || key.contains([':', '\n', '\r']) || key.trim() != key {
        return Err(ManifestError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Manifest parse/construction errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest line {line} is not a `Key: Value` pair")]
    MalformedLine { line: usize },

    #[error("invalid manifest key {0:?}")]
    InvalidKey(String),

    #[error("manifest value for {key:?} contains a line break")]
    InvalidValue { key: String },

    #[error("duplicate manifest key {0:?}")]
    DuplicateKey(String),

    #[error("missing manifest key {0:?}")]
    MissingKey(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn render_then_parse_preserves_attributes() {
        let manifest = Manifest::new()
            .with(keys::AGENT_ENTRY, "hotswap.bootstrap/agent_main")
            .unwrap()
            .with(keys::CAN_REDEFINE_TYPES, "true")
            .unwrap();

        let parsed = Manifest::parse(&manifest.render()).unwrap();
        assert_eq!(parsed, manifest);
        assert_eq!(parsed.entry_point().unwrap(), "hotswap.bootstrap/agent_main");
    }

    #[test]
    fn capability_flag_detection() {
        let without = Manifest::new();
        assert!(!CapabilityFlag::CAN_REDEFINE.is_declared_by(&without));

        let disabled = Manifest::new().with(keys::CAN_REDEFINE_TYPES, "false").unwrap();
        assert!(!CapabilityFlag::CAN_REDEFINE.is_declared_by(&disabled));

        let enabled = Manifest::new().with(keys::CAN_REDEFINE_TYPES, "TRUE").unwrap();
        assert!(CapabilityFlag::CAN_REDEFINE.is_declared_by(&enabled));
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        assert_eq!(
            Manifest::parse("Agent-Entry agent_main\n"),
            Err(ManifestError::MalformedLine { line: 1 })
        );
        assert_eq!(
            Manifest::parse("A: 1\nA: 2\n"),
            Err(ManifestError::DuplicateKey("A".to_string()))
        );
        assert!(matches!(
            Manifest::parse(": value\n"),
            Err(ManifestError::InvalidKey(_))
        ));
    }

    #[test]
    fn insert_rejects_line_breaks() {
        let mut manifest = Manifest::new();
        assert!(manifest.insert("Key", "a\nb").is_err());
        assert!(manifest.insert("Ke\ny", "a").is_err());
        assert!(manifest.is_empty());
    }

    #[test]
    fn require_reports_missing_key() {
        let manifest = Manifest::new();
        assert_eq!(
            manifest.entry_point(),
            Err(ManifestError::MissingKey(keys::AGENT_ENTRY.to_string()))
        );
    }

    proptest! {
        #[test]
        fn parse_accepts_rendered_output(
            entries in proptest::collection::btree_map(
                "[A-Za-z][A-Za-z0-9-]{0,15}",
                "[ -~]{0,32}",
                0..8,
            )
        ) {
            let mut manifest = Manifest::new();
            for (k, v) in &entries {
                manifest.insert(k.clone(), v.trim_start().to_string()).unwrap();
            }
            let parsed = Manifest::parse(&manifest.render()).unwrap();
            prop_assert_eq!(parsed.len(), manifest.len());
        }
    }
}
