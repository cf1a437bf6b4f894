//! Agent loader
//!
//! Accepts a bootstrap artifact, checks its seal and capability flags,
//! resolves its entry point and runs it on a dedicated loader thread. The
//! entry point receives a fresh [`RedefineCapability`] as its only argument.

use crate::capability::RedefineCapability;
use crate::protocol::RejectCode;
use crate::registry::TypeRegistry;
use dashmap::DashMap;
use hotswap_artifact::{keys, CapabilityFlag, ImageDigest, ModuleImage};
use std::fmt;
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use uuid::Uuid;

/// Entry point signature of a loadable agent
pub type EntryPoint = fn(RedefineCapability);

/// Capability flags every artifact must declare
pub const REQUIRED_FLAGS: &[CapabilityFlag] = &[CapabilityFlag::CAN_REDEFINE];

/// Entry points resolvable by name
#[derive(Debug, Default)]
pub struct EntryTable {
    entries: DashMap<String, EntryPoint>,
}

impl EntryTable {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry` under `name`
    ///
    /// Returns false if the name was already registered (the existing
    /// entry is kept).
    pub fn register(&self, name: impl Into<String>, entry: EntryPoint) -> bool {
        match self.entries.entry(name.into()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    /// Look up an entry point
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<EntryPoint> {
        self.entries.get(name).map(|e| *e.value())
    }

    /// Whether `name` is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

/// Outcome of a successful load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedAgent {
    pub agent_id: Option<String>,
    pub entry_point: String,
    pub capability_id: Uuid,
    pub digest: ImageDigest,
}

/// Why an artifact was not loaded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct LoadRejection {
    pub code: RejectCode,
    pub message: String,
}

impl LoadRejection {
    pub(crate) fn new(code: RejectCode, message: impl fmt::Display) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }
}

/// Loads bootstrap artifacts into a runtime
#[derive(Debug, Clone)]
pub struct AgentLoader {
    registry: Arc<TypeRegistry>,
    entries: Arc<EntryTable>,
    max_artifact_bytes: u64,
}

impl AgentLoader {
    pub(crate) fn new(
        registry: Arc<TypeRegistry>,
        entries: Arc<EntryTable>,
        max_artifact_bytes: u64,
    ) -> Self {
        Self {
            registry,
            entries,
            max_artifact_bytes,
        }
    }

    /// Read an artifact file and load it
    ///
    /// # Errors
    /// Returns a rejection if the file is unreadable or too large, or for
    /// any reason [`AgentLoader::load_image`] rejects
    pub fn load_from_path(&self, path: &Path) -> Result<LoadedAgent, LoadRejection> {
        let file = std::fs::File::open(path)
            .map_err(|e| LoadRejection::new(RejectCode::Io, format!("{}: {e}", path.display())))?;
        let mut bytes = Vec::new();
        file.take(self.max_artifact_bytes.saturating_add(1))
            .read_to_end(&mut bytes)
            .map_err(|e| LoadRejection::new(RejectCode::Io, format!("{}: {e}", path.display())))?;
        if bytes.len() as u64 > self.max_artifact_bytes {
            return Err(LoadRejection::new(
                RejectCode::TooLarge,
                format!("artifact exceeds {} bytes", self.max_artifact_bytes),
            ));
        }
        self.load_image(&bytes)
    }

    /// Verify, resolve and run a sealed image
    ///
    /// Blocks until the entry point returns.
    ///
    /// # Errors
    /// Returns a rejection for a corrupt image, a missing capability flag,
    /// an unknown entry point or an entry point that panicked
    pub fn load_image(&self, bytes: &[u8]) -> Result<LoadedAgent, LoadRejection> {
        let image =
            ModuleImage::decode(bytes).map_err(|e| LoadRejection::new(RejectCode::Corrupt, e))?;
        let manifest = image.manifest();

        if let Some(flag) = REQUIRED_FLAGS.iter().find(|f| !f.is_declared_by(manifest)) {
            return Err(LoadRejection::new(
                RejectCode::MissingCapability,
                format!("manifest must declare `{flag}`"),
            ));
        }

        let entry_name = manifest
            .entry_point()
            .map_err(|e| LoadRejection::new(RejectCode::Corrupt, e))?
            .to_string();
        let entry = self.entries.resolve(&entry_name).ok_or_else(|| {
            LoadRejection::new(
                RejectCode::UnknownEntryPoint,
                format!("no entry point named `{entry_name}`"),
            )
        })?;

        let agent_id = manifest.get(keys::AGENT_ID).map(str::to_string);
        let capability = RedefineCapability::grant(
            Arc::clone(&self.registry),
            CapabilityFlag::CAN_REDEFINE.is_declared_by(manifest),
            agent_id.clone(),
        );
        let capability_id = capability.id();

        run_on_loader_thread(&entry_name, entry, capability)?;

        tracing::info!(
            entry = %entry_name,
            agent_id = agent_id.as_deref().unwrap_or("-"),
            capability = %capability_id,
            "agent loaded"
        );
        Ok(LoadedAgent {
            agent_id,
            entry_point: entry_name,
            capability_id,
            digest: ImageDigest::compute(bytes),
        })
    }
}

/// Hands the capability to `entry` on a fresh thread and waits for the
/// thread to report back
fn run_on_loader_thread(
    entry_name: &str,
    entry: EntryPoint,
    capability: RedefineCapability,
) -> Result<(), LoadRejection> {
    let (done_tx, done_rx) = crossbeam::channel::bounded::<bool>(1);
    thread::Builder::new()
        .name("hotswap-agent-loader".to_string())
        .spawn(move || {
            let ok = panic::catch_unwind(AssertUnwindSafe(|| entry(capability))).is_ok();
            let _ = done_tx.send(ok);
        })
        .map_err(|e| LoadRejection::new(RejectCode::Io, format!("cannot spawn loader: {e}")))?;

    match done_rx.recv() {
        Ok(true) => Ok(()),
        Ok(false) | Err(_) => {
            tracing::warn!(entry = %entry_name, "agent entry point panicked");
            Err(LoadRejection::new(
                RejectCode::EntryFailed,
                format!("entry point `{entry_name}` panicked"),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotswap_artifact::{Manifest, ModuleBuilder};
    use parking_lot::Mutex;

    static SEEN: Mutex<Vec<Uuid>> = Mutex::new(Vec::new());

    fn record(capability: RedefineCapability) {
        SEEN.lock().push(capability.id());
    }

    fn explode(_: RedefineCapability) {
        panic!("agent blew up");
    }

    fn loader() -> AgentLoader {
        let entries = Arc::new(EntryTable::new());
        entries.register("test/record", record);
        entries.register("test/explode", explode);
        AgentLoader::new(Arc::new(TypeRegistry::new(true)), entries, 4096)
    }

    fn image_for(entry: &str) -> Vec<u8> {
        ModuleBuilder::new(entry)
            .capability(CapabilityFlag::CAN_REDEFINE)
            .image(Uuid::new_v4())
            .unwrap()
            .encode()
            .unwrap()
    }

    #[test]
    fn entry_point_receives_granted_capability() {
        let loaded = loader().load_image(&image_for("test/record")).unwrap();
        assert_eq!(loaded.entry_point, "test/record");
        assert!(SEEN.lock().contains(&loaded.capability_id));
        assert!(loaded.agent_id.is_some());
    }

    #[test]
    fn missing_flag_is_rejected() {
        let bytes = ModuleBuilder::new("test/record")
            .image(Uuid::new_v4())
            .unwrap()
            .encode()
            .unwrap();
        let err = loader().load_image(&bytes).unwrap_err();
        assert_eq!(err.code, RejectCode::MissingCapability);
    }

    #[test]
    fn unknown_entry_is_rejected() {
        let err = loader().load_image(&image_for("test/nope")).unwrap_err();
        assert_eq!(err.code, RejectCode::UnknownEntryPoint);
    }

    #[test]
    fn corrupt_image_is_rejected() {
        let mut bytes = image_for("test/record");
        let last = bytes.len() - 1;
        bytes[last] ^= 1;
        assert_eq!(
            loader().load_image(&bytes).unwrap_err().code,
            RejectCode::Corrupt
        );

        let no_entry = ModuleImage::new(
            Manifest::new()
                .with(keys::CAN_REDEFINE_TYPES, "true")
                .unwrap(),
            Vec::new(),
        )
        .encode()
        .unwrap();
        assert_eq!(
            loader().load_image(&no_entry).unwrap_err().code,
            RejectCode::Corrupt
        );
    }

    #[test]
    fn panicking_entry_is_reported() {
        let err = loader().load_image(&image_for("test/explode")).unwrap_err();
        assert_eq!(err.code, RejectCode::EntryFailed);
    }

    #[test]
    fn oversized_and_missing_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let big = dir.path().join("big.hsa");
        std::fs::write(&big, vec![0u8; 8192]).unwrap();
        assert_eq!(
            loader().load_from_path(&big).unwrap_err().code,
            RejectCode::TooLarge
        );
        assert_eq!(
            loader()
                .load_from_path(&dir.path().join("absent.hsa"))
                .unwrap_err()
                .code,
            RejectCode::Io
        );
    }

    #[test]
    fn unbounded_limit_still_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.hsa");
        std::fs::write(&path, image_for("test/record")).unwrap();

        let entries = Arc::new(EntryTable::new());
        entries.register("test/record", record);
        let loader = AgentLoader::new(Arc::new(TypeRegistry::new(true)), entries, u64::MAX);

        let loaded = loader.load_from_path(&path).unwrap();
        assert_eq!(loaded.entry_point, "test/record");
    }

    #[test]
    fn entry_table_keeps_first_registration() {
        let table = EntryTable::new();
        assert!(table.register("x", record));
        assert!(!table.register("x", explode));
        assert!(table.contains("x"));
        assert!(table.resolve("y").is_none());
    }
}
