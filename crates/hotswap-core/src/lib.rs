//! Hotswap Core
//!
//! Controller side of live type redefinition: locate a process, deliver the
//! capability bootstrap artifact through its attach socket, then redefine
//! loaded types through the published capability.
//!
//! # Example
//!
//! ```rust,ignore
//! use hotswap_core::{bootstrap_self, redefine, RedefinitionRequest};
//!
//! bootstrap_self()?;
//! let receipt = redefine(&RedefinitionRequest::new().with("app.Greeter", new_body))?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod attacher;
mod config;
mod error;
mod executor;
mod locator;

pub use attacher::{AttachConfig, AttachError, AttachReceipt, Attacher, ENV_ATTACH_TIMEOUT_MS};
pub use config::HotswapConfig;
pub use error::HotswapError;
pub use executor::{
    redefine, RedefinitionError, RedefinitionPair, RedefinitionReceipt, RedefinitionRequest,
    Redefiner,
};
pub use locator::{
    parse_pid, LocatorError, OsStrategy, PidStrategy, ProcessLocator, ProcfsStrategy,
    RuntimeNameStrategy, TargetProcess,
};

use hotswap_artifact::ModuleBuilder;
use hotswap_runtime::ManagedRuntime;
use parking_lot::Mutex;

/// Serializes self-bootstraps so one cannot stop a listener another is using
static SELF_BOOTSTRAP: Mutex<()> = Mutex::new(());

/// Bootstrap the calling process with configuration from the environment
///
/// # Errors
/// See [`bootstrap`]
pub fn bootstrap_self() -> Result<AttachReceipt, HotswapError> {
    bootstrap(None, &HotswapConfig::from_env())
}

/// Deliver the capability bootstrap artifact to `target` (self when `None`)
///
/// For the calling process this first registers the stub with the global
/// runtime and starts its attach listener. A listener started here is
/// stopped again, and its socket file removed, once the exchange is over;
/// one that was already running is left alone. The artifact file is
/// removed before returning, on success and failure alike. Bootstrapping a
/// process that already holds a capability succeeds and keeps the original.
///
/// # Errors
/// Returns error if the target cannot be resolved, the listener cannot be
/// started, the artifact cannot be written or the target rejects it
pub fn bootstrap(
    target: Option<&str>,
    config: &HotswapConfig,
) -> Result<AttachReceipt, HotswapError> {
    let target = ProcessLocator::platform_default().locate(target)?;
    let mut attach = config.attach.clone();

    let _serialized = target.is_self().then(|| SELF_BOOTSTRAP.lock());
    let started_listener = if target.is_self() {
        let runtime = ManagedRuntime::global();
        hotswap_agent::install(runtime);
        let started = runtime.listener_path().is_none();
        runtime.attach_listener().map_err(HotswapError::Listener)?;
        if attach.socket_dir.is_none() {
            attach.socket_dir = Some(runtime.config().resolved_socket_dir());
        }
        started
    } else {
        false
    };

    let result = ModuleBuilder::bootstrap()
        .config(config.build.clone())
        .build()
        .map_err(HotswapError::from)
        .and_then(|artifact| {
            Attacher::new(attach)
                .attach(&target, &artifact)
                .map_err(HotswapError::from)
        });
    if started_listener {
        ManagedRuntime::global().stop_attach_listener();
    }
    let receipt = result?;
    tracing::info!(
        pid = receipt.pid,
        capability = %receipt.capability_id,
        "bootstrap complete"
    );
    Ok(receipt)
}
