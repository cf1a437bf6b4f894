//! Testing utilities for the hotswap workspace
//!
//! Shared type fixtures and tracing setup.

#![allow(missing_docs)]

use hotswap_runtime::{Op, Signature, TypeDefinition, TypeRef, Value, ValueKind};
use std::sync::Once;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static TRACING: Once = Once::new();

/// Install a test-friendly subscriber filtered by `RUST_LOG` (default `warn`)
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

/// `greet(str) -> str` returning `greeting` followed by the argument
pub fn greeter(name: &str, greeting: &str) -> TypeDefinition {
    TypeDefinition::new(name).with_member(
        "greet",
        Signature::new(vec![ValueKind::Str], ValueKind::Str),
        [Op::Push(Value::from(greeting)), Op::Arg(0), Op::Concat, Op::Ret],
    )
}

/// `greet(str) -> str` that ignores its argument and returns `sentinel`
pub fn sentinel_greeter(name: &str, sentinel: &str) -> TypeDefinition {
    TypeDefinition::new(name).with_member(
        "greet",
        Signature::new(vec![ValueKind::Str], ValueKind::Str),
        [Op::Push(Value::from(sentinel)), Op::Ret],
    )
}

/// `next(int) -> int` adding `step` to its argument
pub fn counter(name: &str, step: i64) -> TypeDefinition {
    TypeDefinition::new(name).with_member(
        "next",
        Signature::new(vec![ValueKind::Int], ValueKind::Int),
        [Op::Arg(0), Op::Push(Value::Int(step)), Op::Add, Op::Ret],
    )
}

/// `def` with an added `extra() -> unit` member, a shape change
pub fn with_extra_member(def: TypeDefinition) -> TypeDefinition {
    def.with_member(
        "extra",
        Signature::new(Vec::new(), ValueKind::Unit),
        [Op::Push(Value::Unit), Op::Ret],
    )
}

/// Serialized form of `def`
pub fn body_bytes(def: &TypeDefinition) -> Vec<u8> {
    def.to_bytes().unwrap()
}

/// Call `greet` with `arg` and return the string result
pub fn greet(runtime: &hotswap_runtime::ManagedRuntime, ty: &TypeRef, arg: &str) -> String {
    runtime
        .invoke(ty, "greet", &[Value::from(arg)])
        .unwrap()
        .as_str()
        .unwrap()
        .to_string()
}

/// Call `next` with `arg` and return the integer result
pub fn next(runtime: &hotswap_runtime::ManagedRuntime, ty: &TypeRef, arg: i64) -> i64 {
    runtime
        .invoke(ty, "next", &[Value::Int(arg)])
        .unwrap()
        .as_int()
        .unwrap()
}
