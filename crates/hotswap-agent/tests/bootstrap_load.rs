//! The bootstrap artifact, loaded by a runtime, publishes the granted handle.

use hotswap_agent::{install, CAPABILITY};
use hotswap_artifact::{BuildConfig, ModuleBuilder};
use hotswap_runtime::{ManagedRuntime, RuntimeConfig};

#[test]
fn loading_bootstrap_artifact_publishes_capability() {
    hotswap_test_utils::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let runtime = ManagedRuntime::new(RuntimeConfig::new());
    assert!(install(&runtime));
    assert!(CAPABILITY.get().is_none());

    let build = || {
        ModuleBuilder::bootstrap()
            .config(BuildConfig::new().with_temp_dir(dir.path()))
            .build()
            .unwrap()
    };

    let first = runtime.load_agent(build().path()).unwrap();
    let published = CAPABILITY.get().unwrap();
    assert_eq!(published.id(), first.capability_id);
    assert!(published.is_redefine_supported());

    // A second bootstrap is acknowledged but leaves the slot alone.
    let second = runtime.load_agent(build().path()).unwrap();
    assert_ne!(second.capability_id, first.capability_id);
    assert_eq!(CAPABILITY.get().unwrap().id(), first.capability_id);
}
