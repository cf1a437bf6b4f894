//! Racing publishers leave exactly one capability in the process-wide slot.

use hotswap_agent::{agent_main, CAPABILITY};
use hotswap_runtime::{ManagedRuntime, RuntimeConfig};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

const PUBLISHERS: usize = 16;

#[test]
fn concurrent_bootstraps_publish_one_identity() {
    hotswap_test_utils::init_tracing();
    let runtime = ManagedRuntime::new(RuntimeConfig::new());
    let grants: Vec<_> = (0..PUBLISHERS)
        .map(|_| runtime.grant_for_testing(true))
        .collect();
    let offered: HashSet<_> = grants.iter().map(|g| g.id()).collect();
    assert_eq!(offered.len(), PUBLISHERS);

    let barrier = Arc::new(Barrier::new(PUBLISHERS));
    let handles: Vec<_> = grants
        .into_iter()
        .map(|grant| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                agent_main(grant);
                CAPABILITY.get().map(|c| c.id())
            })
        })
        .collect();

    let observed: HashSet<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();
    assert_eq!(observed.len(), 1);

    let stored = CAPABILITY.get().unwrap().id();
    assert!(observed.contains(&stored));
    assert!(offered.contains(&stored));
}
