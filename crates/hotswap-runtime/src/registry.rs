//! Type registry and redefinition facility
//!
//! Holds every loaded type. Invocation clones the current definition out
//! under a read lock and runs it unlocked, so a redefinition never waits on
//! running code and running code never observes half of a batch.

use crate::interp::{self, InvokeError};
use crate::model::{ShapeChange, TypeDefinition, TypeRef, Value};
use crate::verify::{verify_definition, VerifyError};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One (existing type, new body) pair submitted for redefinition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRedefinition {
    pub target: TypeRef,
    pub bytes: Vec<u8>,
}

impl TypeRedefinition {
    /// Create a pair
    #[must_use]
    pub fn new(target: impl Into<TypeRef>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            target: target.into(),
            bytes: bytes.into(),
        }
    }
}

/// Why a type could not be defined
#[derive(Debug, thiserror::Error)]
pub enum DefineError {
    #[error("malformed definition: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("verification failed: {0}")]
    Verification(#[from] VerifyError),

    #[error("type `{0}` is already loaded")]
    AlreadyLoaded(TypeRef),
}

/// Why the runtime refused a redefinition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RedefineFailure {
    #[error("type `{0}` is not loaded")]
    TypeNotLoaded(TypeRef),

    #[error("redefinition of `{target}` changes its shape: {}", describe(changes))]
    ShapeChanged {
        target: TypeRef,
        changes: Vec<ShapeChange>,
    },

    #[error("new body for `{target}` is malformed: {reason}")]
    Malformed { target: TypeRef, reason: String },

    #[error("new body for `{target}` defines `{found}`")]
    NameMismatch { target: TypeRef, found: TypeRef },

    #[error("new body for `{target}` failed verification: {source}")]
    Verification {
        target: TypeRef,
        #[source]
        source: VerifyError,
    },

    #[error("type `{0}` appears more than once in the batch")]
    DuplicateTarget(TypeRef),

    #[error("capability was granted without redefinition support")]
    NotPermitted,

    #[error("{} of the batch applied before failure: {source}", applied.len())]
    PartiallyApplied {
        applied: Vec<TypeRef>,
        #[source]
        source: Box<RedefineFailure>,
    },
}

fn describe(changes: &[ShapeChange]) -> String {
    changes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone)]
struct LoadedType {
    definition: Arc<TypeDefinition>,
    generation: u64,
}

/// Loaded types of one runtime
#[derive(Debug)]
pub struct TypeRegistry {
    types: RwLock<HashMap<TypeRef, LoadedType>>,
    batch_atomic: bool,
}

impl TypeRegistry {
    /// Empty registry
    ///
    /// With `batch_atomic` false, a batch is applied pair by pair and a
    /// failure leaves earlier pairs applied.
    #[must_use]
    pub fn new(batch_atomic: bool) -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
            batch_atomic,
        }
    }

    /// Whether a batch is applied all-or-nothing
    #[inline]
    #[must_use]
    pub fn is_batch_atomic(&self) -> bool {
        self.batch_atomic
    }

    /// Load a type from its serialized form
    ///
    /// # Errors
    /// Returns error if the bytes are malformed, fail verification or name
    /// a type that is already loaded
    pub fn define_bytes(&self, bytes: &[u8]) -> Result<TypeRef, DefineError> {
        self.define(TypeDefinition::from_bytes(bytes)?)
    }

    /// Load a type
    ///
    /// # Errors
    /// Returns error if the definition fails verification or is already loaded
    pub fn define(&self, definition: TypeDefinition) -> Result<TypeRef, DefineError> {
        verify_definition(&definition)?;
        let name = definition.name.clone();
        let mut types = self.types.write();
        if types.contains_key(&name) {
            return Err(DefineError::AlreadyLoaded(name));
        }
        types.insert(
            name.clone(),
            LoadedType {
                definition: Arc::new(definition),
                generation: 0,
            },
        );
        tracing::debug!(ty = %name, "type defined");
        Ok(name)
    }

    /// Whether `ty` is loaded
    #[must_use]
    pub fn is_loaded(&self, ty: &TypeRef) -> bool {
        self.types.read().contains_key(ty)
    }

    /// All loaded types, sorted by name
    #[must_use]
    pub fn loaded_types(&self) -> Vec<TypeRef> {
        let mut names: Vec<TypeRef> = self.types.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Current definition of `ty`
    #[must_use]
    pub fn definition(&self, ty: &TypeRef) -> Option<Arc<TypeDefinition>> {
        self.types.read().get(ty).map(|t| Arc::clone(&t.definition))
    }

    /// Number of times `ty` has been redefined
    #[must_use]
    pub fn generation(&self, ty: &TypeRef) -> Option<u64> {
        self.types.read().get(ty).map(|t| t.generation)
    }

    /// Invoke `member` of `ty` against its current definition
    ///
    /// # Errors
    /// Returns error if the type or member is missing, or execution fails
    pub fn invoke(&self, ty: &TypeRef, member: &str, args: &[Value]) -> Result<Value, InvokeError> {
        let definition = self
            .definition(ty)
            .ok_or_else(|| InvokeError::TypeNotLoaded(ty.clone()))?;
        let def = definition
            .member(member)
            .ok_or_else(|| InvokeError::NoSuchMember {
                ty: ty.clone(),
                member: member.to_string(),
            })?;
        interp::execute(def, args)
    }

    /// Replace the bodies of loaded types
    ///
    /// Atomic registries check every pair before committing any and commit
    /// under a single write lock. Non-atomic registries apply each pair as
    /// soon as it passes its own checks.
    ///
    /// # Errors
    /// Returns the first failure; non-atomic registries wrap it in
    /// [`RedefineFailure::PartiallyApplied`] when earlier pairs were applied
    pub fn redefine(&self, batch: &[TypeRedefinition]) -> Result<(), RedefineFailure> {
        let mut seen = HashSet::new();
        for pair in batch {
            if !seen.insert(&pair.target) {
                return Err(RedefineFailure::DuplicateTarget(pair.target.clone()));
            }
        }
        if self.batch_atomic {
            self.redefine_atomic(batch)
        } else {
            self.redefine_each(batch)
        }
    }

    fn redefine_atomic(&self, batch: &[TypeRedefinition]) -> Result<(), RedefineFailure> {
        let prepared = batch
            .iter()
            .map(prepare)
            .collect::<Result<Vec<_>, _>>()?;

        let mut types = self.types.write();
        for definition in &prepared {
            check_shape(&types, definition)?;
        }
        for definition in prepared {
            commit(&mut types, definition);
        }
        Ok(())
    }

    fn redefine_each(&self, batch: &[TypeRedefinition]) -> Result<(), RedefineFailure> {
        let mut applied = Vec::new();
        for pair in batch {
            let outcome = prepare(pair).and_then(|definition| {
                let mut types = self.types.write();
                check_shape(&types, &definition)?;
                commit(&mut types, definition);
                Ok(())
            });
            match outcome {
                Ok(()) => applied.push(pair.target.clone()),
                Err(failure) if applied.is_empty() => return Err(failure),
                Err(failure) => {
                    return Err(RedefineFailure::PartiallyApplied {
                        applied,
                        source: Box::new(failure),
                    })
                }
            }
        }
        Ok(())
    }
}

fn prepare(pair: &TypeRedefinition) -> Result<TypeDefinition, RedefineFailure> {
    let definition =
        TypeDefinition::from_bytes(&pair.bytes).map_err(|e| RedefineFailure::Malformed {
            target: pair.target.clone(),
            reason: e.to_string(),
        })?;
    if definition.name != pair.target {
        return Err(RedefineFailure::NameMismatch {
            target: pair.target.clone(),
            found: definition.name,
        });
    }
    verify_definition(&definition).map_err(|source| RedefineFailure::Verification {
        target: pair.target.clone(),
        source,
    })?;
    Ok(definition)
}

fn check_shape(
    types: &HashMap<TypeRef, LoadedType>,
    definition: &TypeDefinition,
) -> Result<(), RedefineFailure> {
    let current = types
        .get(&definition.name)
        .ok_or_else(|| RedefineFailure::TypeNotLoaded(definition.name.clone()))?;
    let changes = current.definition.shape().diff(&definition.shape());
    if changes.is_empty() {
        Ok(())
    } else {
        Err(RedefineFailure::ShapeChanged {
            target: definition.name.clone(),
            changes,
        })
    }
}

fn commit(types: &mut HashMap<TypeRef, LoadedType>, definition: TypeDefinition) {
    if let Some(slot) = types.get_mut(&definition.name) {
        slot.generation += 1;
        tracing::debug!(ty = %definition.name, generation = slot.generation, "type redefined");
        slot.definition = Arc::new(definition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Op, Signature, ValueKind};

    fn greeter(name: &str, greeting: &str) -> TypeDefinition {
        TypeDefinition::new(name).with_member(
            "greet",
            Signature::new(vec![ValueKind::Str], ValueKind::Str),
            [Op::Push(greeting.into()), Op::Arg(0), Op::Concat, Op::Ret],
        )
    }

    fn pair(def: &TypeDefinition) -> TypeRedefinition {
        TypeRedefinition::new(def.name.clone(), def.to_bytes().unwrap())
    }

    fn greet(registry: &TypeRegistry, ty: &str) -> String {
        registry
            .invoke(&TypeRef::from(ty), "greet", &["bob".into()])
            .unwrap()
            .as_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn define_and_invoke() {
        let registry = TypeRegistry::new(true);
        let ty = registry.define(greeter("a.Greeter", "hi ")).unwrap();
        assert!(registry.is_loaded(&ty));
        assert_eq!(greet(&registry, "a.Greeter"), "hi bob");
        assert_eq!(registry.generation(&ty), Some(0));
    }

    #[test]
    fn define_twice_is_rejected() {
        let registry = TypeRegistry::new(true);
        registry.define(greeter("a.Greeter", "hi ")).unwrap();
        assert!(matches!(
            registry.define(greeter("a.Greeter", "yo ")),
            Err(DefineError::AlreadyLoaded(_))
        ));
    }

    #[test]
    fn define_bytes_rejects_garbage() {
        let registry = TypeRegistry::new(true);
        assert!(matches!(
            registry.define_bytes(b"not json"),
            Err(DefineError::Malformed(_))
        ));
    }

    #[test]
    fn redefine_replaces_body() {
        let registry = TypeRegistry::new(true);
        let ty = registry.define(greeter("a.Greeter", "hi ")).unwrap();
        registry.redefine(&[pair(&greeter("a.Greeter", "hey "))]).unwrap();
        assert_eq!(greet(&registry, "a.Greeter"), "hey bob");
        assert_eq!(registry.generation(&ty), Some(1));
    }

    #[test]
    fn atomic_batch_applies_nothing_on_shape_change() {
        let registry = TypeRegistry::new(true);
        registry.define(greeter("a.One", "one ")).unwrap();
        registry.define(greeter("a.Two", "two ")).unwrap();

        let grown = greeter("a.Two", "two* ").with_member(
            "extra",
            Signature::new(vec![], ValueKind::Int),
            [Op::Push(Value::Int(0)), Op::Ret],
        );
        let err = registry
            .redefine(&[pair(&greeter("a.One", "one* ")), pair(&grown)])
            .unwrap_err();

        assert!(matches!(err, RedefineFailure::ShapeChanged { .. }));
        assert_eq!(greet(&registry, "a.One"), "one bob");
        assert_eq!(greet(&registry, "a.Two"), "two bob");
    }

    #[test]
    fn non_atomic_batch_reports_partial_application() {
        let registry = TypeRegistry::new(false);
        registry.define(greeter("a.One", "one ")).unwrap();

        let err = registry
            .redefine(&[
                pair(&greeter("a.One", "one* ")),
                pair(&greeter("a.Missing", "x ")),
            ])
            .unwrap_err();

        match err {
            RedefineFailure::PartiallyApplied { applied, source } => {
                assert_eq!(applied, vec![TypeRef::from("a.One")]);
                assert_eq!(
                    *source,
                    RedefineFailure::TypeNotLoaded(TypeRef::from("a.Missing"))
                );
            }
            other => panic!("unexpected failure: {other:?}"),
        }
        assert_eq!(greet(&registry, "a.One"), "one* bob");
    }

    #[test]
    fn redefine_rejects_mismatched_name_and_duplicates() {
        let registry = TypeRegistry::new(true);
        registry.define(greeter("a.One", "one ")).unwrap();

        let wrong = TypeRedefinition::new("a.One", greeter("a.Other", "x ").to_bytes().unwrap());
        assert!(matches!(
            registry.redefine(&[wrong]),
            Err(RedefineFailure::NameMismatch { .. })
        ));

        let p = pair(&greeter("a.One", "again "));
        assert_eq!(
            registry.redefine(&[p.clone(), p]),
            Err(RedefineFailure::DuplicateTarget(TypeRef::from("a.One")))
        );
    }

    #[test]
    fn redefine_rejects_unverifiable_body() {
        let registry = TypeRegistry::new(true);
        registry.define(greeter("a.One", "one ")).unwrap();
        let broken = TypeDefinition::new("a.One").with_member(
            "greet",
            Signature::new(vec![ValueKind::Str], ValueKind::Str),
            [Op::Concat, Op::Ret],
        );
        assert!(matches!(
            registry.redefine(&[pair(&broken)]),
            Err(RedefineFailure::Verification { .. })
        ));
        assert_eq!(greet(&registry, "a.One"), "one bob");
    }
}
