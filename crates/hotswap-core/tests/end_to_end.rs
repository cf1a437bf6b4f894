//! Bootstrap the test process through its own attach socket, then redefine.
//!
//! Every test uses its own type names; they all share the process-wide
//! runtime and capability.

#![cfg(unix)]

use hotswap_core::{bootstrap_self, redefine, HotswapError, RedefinitionError, RedefinitionRequest};
use hotswap_runtime::{ManagedRuntime, TypeRef};
use hotswap_test_utils::{
    body_bytes, counter, greet, greeter, next, sentinel_greeter, with_extra_member,
};

fn bootstrapped() -> &'static ManagedRuntime {
    hotswap_test_utils::init_tracing();
    bootstrap_self().unwrap();
    ManagedRuntime::global()
}

#[test]
fn sentinel_body_becomes_active() {
    let runtime = bootstrapped();
    let ty = runtime.define(greeter("e2e.Sentinel", "hello ")).unwrap();
    assert_eq!(greet(runtime, &ty, "world"), "hello world");

    let sentinel = body_bytes(&sentinel_greeter("e2e.Sentinel", "SENTINEL"));
    let request = RedefinitionRequest::new().with(ty.clone(), sentinel);
    let receipt = redefine(&request).unwrap();

    assert_eq!(receipt.applied, vec![ty.clone()]);
    assert!(receipt.atomic);
    assert_eq!(
        Some(receipt.capability_id),
        hotswap_agent::CAPABILITY.get().map(|c| c.id())
    );
    assert_eq!(greet(runtime, &ty, "world"), "SENTINEL");
}

#[test]
fn unloaded_type_is_reported() {
    bootstrapped();
    let request = RedefinitionRequest::new()
        .with("e2e.NeverLoaded", body_bytes(&greeter("e2e.NeverLoaded", "x")));
    assert_eq!(
        redefine(&request),
        Err(RedefinitionError::TypeNotLoaded(TypeRef::from("e2e.NeverLoaded")))
    );
}

#[test]
fn member_addition_is_schema_change() {
    let runtime = bootstrapped();
    let ty = runtime.define(greeter("e2e.Schema", "hi ")).unwrap();
    let request = RedefinitionRequest::new()
        .with(ty.clone(), body_bytes(&with_extra_member(greeter("e2e.Schema", "hi "))));
    let err = redefine(&request).unwrap_err();
    assert!(matches!(err, RedefinitionError::SchemaChangeRejected { .. }), "{err}");
    assert_eq!(greet(runtime, &ty, "bo"), "hi bo");
}

#[test]
fn failing_pair_leaves_whole_batch_unapplied() {
    let runtime = bootstrapped();
    let count = runtime.define(counter("e2e.AtomicCounter", 1)).unwrap();
    let greeting = runtime.define(greeter("e2e.AtomicGreeter", "hi ")).unwrap();

    let request = RedefinitionRequest::new()
        .with(count.clone(), body_bytes(&counter("e2e.AtomicCounter", 50)))
        .with(
            greeting.clone(),
            body_bytes(&with_extra_member(greeter("e2e.AtomicGreeter", "yo "))),
        );
    let err = redefine(&request).unwrap_err();
    assert!(matches!(err, RedefinitionError::SchemaChangeRejected { .. }));

    assert_eq!(next(runtime, &count, 1), 2);
    assert_eq!(greet(runtime, &greeting, "al"), "hi al");
    assert_eq!(runtime.generation(&count), Some(0));
}

#[test]
fn repeated_bootstrap_keeps_first_capability() {
    bootstrapped();
    let first = hotswap_agent::CAPABILITY.get().unwrap().id();
    let receipt = bootstrap_self().unwrap();
    assert_ne!(receipt.capability_id, first);
    assert_eq!(hotswap_agent::CAPABILITY.get().unwrap().id(), first);
}

#[test]
fn invalid_explicit_target_is_a_locate_error() {
    let err = hotswap_core::bootstrap(Some("not-a-pid"), &hotswap_core::HotswapConfig::new())
        .unwrap_err();
    assert!(matches!(err, HotswapError::Locate(_)));
}
