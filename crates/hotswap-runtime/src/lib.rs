//! Hotswap Runtime
//!
//! A small managed runtime whose types can have their member bodies
//! replaced while the process keeps running.
//!
//! # Core Concepts
//!
//! - [`ManagedRuntime`]: owns loaded types, entry points and the attach listener
//! - [`TypeDefinition`]: a named set of members, each a verified stack-machine body
//! - [`TypeRegistry::redefine`]: swaps bodies; the member set and signatures must not change
//! - [`RedefineCapability`]: handle to the redefinition facility, only handed
//!   to the entry point of a loaded agent
//! - [`AttachListener`]: Unix socket through which a controller asks the
//!   runtime to load an agent artifact
//!
//! # Example
//!
//! ```rust,ignore
//! use hotswap_runtime::{ManagedRuntime, RuntimeConfig, TypeDefinition};
//!
//! let runtime = ManagedRuntime::new(RuntimeConfig::from_env());
//! runtime.define(TypeDefinition::from_bytes(&bytes)?)?;
//! runtime.attach_listener()?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod capability;
mod config;
mod interp;
mod listener;
mod loader;
mod management;
mod model;
mod protocol;
mod registry;
mod runtime;
mod verify;

pub use capability::RedefineCapability;
pub use config::{ConfigError, RuntimeConfig, DEFAULT_MAX_ARTIFACT_BYTES, ENV_SOCKET_DIR};
pub use interp::InvokeError;
pub use listener::{AttachListener, REQUEST_READ_TIMEOUT};
pub use loader::{AgentLoader, EntryPoint, EntryTable, LoadRejection, LoadedAgent, REQUIRED_FLAGS};
pub use management::RuntimeManagement;
pub use model::{
    MemberDef, Op, ShapeChange, Signature, TypeDefinition, TypeRef, TypeShape, Value, ValueKind,
};
pub use protocol::{
    read_message, socket_path, write_message, ProtocolError, RejectCode, Request, Response,
    MAX_MESSAGE_BYTES, PROTOCOL_VERSION, SOCKET_PREFIX,
};
pub use registry::{DefineError, RedefineFailure, TypeRedefinition, TypeRegistry};
pub use runtime::ManagedRuntime;
pub use verify::{verify_definition, verify_member, VerifyError, VerifyErrorKind, MAX_STACK_DEPTH};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
