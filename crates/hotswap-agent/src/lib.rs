//! Hotswap Agent
//!
//! The capability bootstrap stub. The runtime's agent loader calls
//! [`agent_main`] with a freshly granted [`RedefineCapability`]; the stub
//! stores it in the process-wide [`CAPABILITY`] slot and returns.
//!
//! Only the first published capability is kept. Later loads of the stub
//! (repeated bootstraps, racing controllers) are no-ops.
//!
//! # Example
//!
//! ```rust,ignore
//! use hotswap_runtime::ManagedRuntime;
//!
//! hotswap_agent::install(ManagedRuntime::global());
//! // ... a controller attaches and loads the bootstrap artifact ...
//! let capability = hotswap_agent::CAPABILITY.get().expect("bootstrapped");
//! ```

#![warn(unreachable_pub)]

use hotswap_artifact::BOOTSTRAP_ENTRY_POINT;
use hotswap_runtime::{ManagedRuntime, RedefineCapability};
use once_cell::sync::OnceCell;

/// Process-wide capability slot
///
/// Written at most once; reads never block once written.
pub static CAPABILITY: CapabilitySlot = CapabilitySlot::new();

/// Single-initialization cell holding a [`RedefineCapability`]
#[derive(Debug)]
pub struct CapabilitySlot {
    cell: OnceCell<RedefineCapability>,
}

impl CapabilitySlot {
    /// Empty slot
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    /// Store `capability` if the slot is empty
    ///
    /// Returns true if this call stored it. When the slot is already set the
    /// argument is dropped and the stored handle is untouched.
    pub fn try_init(&self, capability: RedefineCapability) -> bool {
        self.cell.set(capability).is_ok()
    }

    /// The stored capability, if any
    #[must_use]
    pub fn get(&self) -> Option<&RedefineCapability> {
        self.cell.get()
    }
}

impl Default for CapabilitySlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point of the bootstrap artifact
pub fn agent_main(capability: RedefineCapability) {
    publish(&CAPABILITY, capability);
}

/// Register [`agent_main`] under [`BOOTSTRAP_ENTRY_POINT`] in `runtime`
///
/// Returns false if the entry point was already registered.
pub fn install(runtime: &ManagedRuntime) -> bool {
    runtime.register_entry_point(BOOTSTRAP_ENTRY_POINT, agent_main)
}

fn publish(slot: &CapabilitySlot, capability: RedefineCapability) -> bool {
    let id = capability.id();
    let stored = slot.try_init(capability);
    if stored {
        tracing::info!(capability = %id, "redefinition capability published");
    } else {
        tracing::debug!(capability = %id, "capability already published, discarding");
    }
    stored
}
