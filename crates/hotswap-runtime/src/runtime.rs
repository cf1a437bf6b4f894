//! Managed runtime

use crate::config::RuntimeConfig;
use crate::interp::InvokeError;
use crate::listener::AttachListener;
use crate::loader::{AgentLoader, EntryPoint, EntryTable, LoadRejection, LoadedAgent};
use crate::management::RuntimeManagement;
use crate::model::{TypeDefinition, TypeRef, Value};
use crate::registry::{DefineError, TypeRegistry};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Never dropped: a listener left running on it keeps its socket file until
/// [`ManagedRuntime::stop_attach_listener`] is called.
static GLOBAL: Lazy<ManagedRuntime> = Lazy::new(|| ManagedRuntime::new(RuntimeConfig::from_env()));

/// A runtime hosting redefinable types
///
/// Most processes use the lazily created [`ManagedRuntime::global`]
/// instance; tests construct their own.
#[derive(Debug)]
pub struct ManagedRuntime {
    config: RuntimeConfig,
    registry: Arc<TypeRegistry>,
    entries: Arc<EntryTable>,
    management: RuntimeManagement,
    listener: Mutex<Option<AttachListener>>,
}

impl ManagedRuntime {
    /// Create a runtime with no types and no entry points
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let registry = Arc::new(TypeRegistry::new(config.batch_atomic_redefinition));
        let management = RuntimeManagement::detect();
        tracing::debug!(
            name = %management.name(),
            atomic = config.batch_atomic_redefinition,
            "runtime created"
        );
        Self {
            config,
            registry,
            entries: Arc::new(EntryTable::new()),
            management,
            listener: Mutex::new(None),
        }
    }

    /// Process-wide runtime, configured from the environment on first use
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Configuration this runtime was created with
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Management surface
    #[must_use]
    pub fn management(&self) -> &RuntimeManagement {
        &self.management
    }

    /// Load a type
    ///
    /// # Errors
    /// See [`TypeRegistry::define`]
    pub fn define(&self, definition: TypeDefinition) -> Result<TypeRef, DefineError> {
        self.registry.define(definition)
    }

    /// Load a type from its serialized form
    ///
    /// # Errors
    /// See [`TypeRegistry::define_bytes`]
    pub fn define_bytes(&self, bytes: &[u8]) -> Result<TypeRef, DefineError> {
        self.registry.define_bytes(bytes)
    }

    /// Invoke a member against the type's current definition
    ///
    /// # Errors
    /// See [`TypeRegistry::invoke`]
    pub fn invoke(&self, ty: &TypeRef, member: &str, args: &[Value]) -> Result<Value, InvokeError> {
        self.registry.invoke(ty, member, args)
    }

    #[must_use]
    pub fn is_loaded(&self, ty: &TypeRef) -> bool {
        self.registry.is_loaded(ty)
    }

    #[must_use]
    pub fn loaded_types(&self) -> Vec<TypeRef> {
        self.registry.loaded_types()
    }

    /// Times `ty` has been redefined, `None` if it is not loaded
    #[must_use]
    pub fn generation(&self, ty: &TypeRef) -> Option<u64> {
        self.registry.generation(ty)
    }

    /// Make `entry` resolvable by artifacts naming `name`
    ///
    /// Returns false if the name was taken.
    pub fn register_entry_point(&self, name: impl Into<String>, entry: EntryPoint) -> bool {
        let name = name.into();
        let added = self.entries.register(name.clone(), entry);
        if added {
            tracing::debug!(entry = %name, "entry point registered");
        }
        added
    }

    /// Loader bound to this runtime's types and entry points
    #[must_use]
    pub fn loader(&self) -> AgentLoader {
        AgentLoader::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.entries),
            self.config.max_artifact_bytes,
        )
    }

    /// Load an artifact directly, without going through the attach socket
    ///
    /// # Errors
    /// See [`AgentLoader::load_from_path`]
    pub fn load_agent(&self, path: &Path) -> Result<LoadedAgent, LoadRejection> {
        self.loader().load_from_path(path)
    }

    /// Start the attach listener if it is not running yet
    ///
    /// Returns the socket path.
    ///
    /// # Errors
    /// Returns error if the socket cannot be bound
    pub fn attach_listener(&self) -> io::Result<PathBuf> {
        let mut slot = self.listener.lock();
        if let Some(listener) = slot.as_ref() {
            return Ok(listener.path().to_path_buf());
        }
        let listener = AttachListener::bind(&self.config.resolved_socket_dir(), self.loader())?;
        let path = listener.path().to_path_buf();
        *slot = Some(listener);
        Ok(path)
    }

    /// Socket path of the running listener
    #[must_use]
    pub fn listener_path(&self) -> Option<PathBuf> {
        self.listener
            .lock()
            .as_ref()
            .map(|listener| listener.path().to_path_buf())
    }

    /// Stop the listener and remove its socket file
    ///
    /// Returns false if no listener was running.
    pub fn stop_attach_listener(&self) -> bool {
        let stopped = self.listener.lock().take();
        // Joined outside the lock.
        stopped.is_some()
    }

    /// Grant a capability without going through an artifact
    #[cfg(any(test, feature = "test-support"))]
    #[must_use]
    pub fn grant_for_testing(&self, can_redefine: bool) -> crate::RedefineCapability {
        crate::RedefineCapability::grant(Arc::clone(&self.registry), can_redefine, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::RedefineCapability;
    use crate::model::{Op, Signature, ValueKind};
    use crate::protocol::RejectCode;
    use crate::registry::TypeRedefinition;
    use hotswap_artifact::{BuildConfig, CapabilityFlag, ModuleBuilder};
    use parking_lot::Mutex;

    fn greeter(greeting: &str) -> TypeDefinition {
        TypeDefinition::new("rt.Greeter").with_member(
            "greet",
            Signature::new(vec![ValueKind::Str], ValueKind::Str),
            [Op::Push(Value::from(greeting)), Op::Arg(0), Op::Concat, Op::Ret],
        )
    }

    #[test]
    fn define_and_invoke() {
        let runtime = ManagedRuntime::new(RuntimeConfig::new());
        let ty = runtime.define(greeter("hi ")).unwrap();
        assert!(runtime.is_loaded(&ty));
        assert_eq!(
            runtime.invoke(&ty, "greet", &[Value::from("bob")]).unwrap(),
            Value::from("hi bob")
        );
        assert_eq!(runtime.generation(&ty), Some(0));
    }

    #[test]
    fn test_grant_reaches_registry() {
        let runtime = ManagedRuntime::new(RuntimeConfig::new());
        let ty = runtime.define(greeter("hi ")).unwrap();
        let cap = runtime.grant_for_testing(true);
        let bytes = greeter("yo ").to_bytes().unwrap();
        cap.redefine_types(&[TypeRedefinition::new(ty.clone(), bytes)])
            .unwrap();
        assert_eq!(
            runtime.invoke(&ty, "greet", &[Value::from("al")]).unwrap(),
            Value::from("yo al")
        );
        assert_eq!(runtime.generation(&ty), Some(1));
    }

    static GRANTED: Mutex<Option<bool>> = Mutex::new(None);

    fn capture(capability: RedefineCapability) {
        *GRANTED.lock() = Some(capability.is_redefine_supported());
    }

    #[test]
    fn load_agent_runs_registered_entry() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ManagedRuntime::new(RuntimeConfig::new());
        assert!(runtime.register_entry_point("rt/capture", capture));
        assert!(!runtime.register_entry_point("rt/capture", capture));

        let artifact = ModuleBuilder::new("rt/capture")
            .capability(CapabilityFlag::CAN_REDEFINE)
            .config(BuildConfig::new().with_temp_dir(dir.path()))
            .build()
            .unwrap();
        let loaded = runtime.load_agent(artifact.path()).unwrap();
        assert_eq!(loaded.digest, artifact.digest());
        assert_eq!(*GRANTED.lock(), Some(true));
    }

    #[test]
    fn load_agent_respects_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ManagedRuntime::new(RuntimeConfig::new().with_max_artifact_bytes(16));
        runtime.register_entry_point("rt/capture", capture);
        let artifact = ModuleBuilder::new("rt/capture")
            .capability(CapabilityFlag::CAN_REDEFINE)
            .config(BuildConfig::new().with_temp_dir(dir.path()))
            .build()
            .unwrap();
        let err = runtime.load_agent(artifact.path()).unwrap_err();
        assert_eq!(err.code, RejectCode::TooLarge);
    }

    #[cfg(unix)]
    #[test]
    fn listener_starts_once() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ManagedRuntime::new(RuntimeConfig::new().with_socket_dir(dir.path()));
        assert!(runtime.listener_path().is_none());
        let first = runtime.attach_listener().unwrap();
        let second = runtime.attach_listener().unwrap();
        assert_eq!(first, second);
        assert_eq!(runtime.listener_path(), Some(first));
    }

    #[cfg(unix)]
    #[test]
    fn stopped_listener_removes_socket_and_can_restart() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ManagedRuntime::new(RuntimeConfig::new().with_socket_dir(dir.path()));
        assert!(!runtime.stop_attach_listener());

        let path = runtime.attach_listener().unwrap();
        assert!(path.exists());
        assert!(runtime.stop_attach_listener());
        assert!(!path.exists());
        assert!(runtime.listener_path().is_none());

        assert_eq!(runtime.attach_listener().unwrap(), path);
        assert!(path.exists());
    }
}
