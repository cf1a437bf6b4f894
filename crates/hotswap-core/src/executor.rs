//! Redefinition executor
//!
//! Takes a batch of (type, new body) pairs and drives it through the
//! published [`RedefineCapability`]. On runtimes that apply a batch
//! atomically the batch is submitted in one call. Otherwise pairs are
//! applied one by one against snapshots, and a failure rolls the earlier
//! pairs back in reverse order.

use hotswap_agent::{CapabilitySlot, CAPABILITY};
use hotswap_runtime::{RedefineCapability, RedefineFailure, ShapeChange, TypeRedefinition, TypeRef};
use std::collections::HashSet;
use uuid::Uuid;

/// One (loaded type, new serialized body) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedefinitionPair {
    pub target: TypeRef,
    pub body: Vec<u8>,
}

/// Ordered batch of redefinitions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedefinitionRequest {
    pairs: Vec<RedefinitionPair>,
}

impl RedefinitionRequest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pair
    pub fn push(&mut self, target: impl Into<TypeRef>, body: impl Into<Vec<u8>>) {
        self.pairs.push(RedefinitionPair {
            target: target.into(),
            body: body.into(),
        });
    }

    /// Builder-style [`RedefinitionRequest::push`]
    #[must_use]
    pub fn with(mut self, target: impl Into<TypeRef>, body: impl Into<Vec<u8>>) -> Self {
        self.push(target, body);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RedefinitionPair> {
        self.pairs.iter()
    }

    fn to_batch(&self) -> Vec<TypeRedefinition> {
        self.pairs
            .iter()
            .map(|p| TypeRedefinition::new(p.target.clone(), p.body.clone()))
            .collect()
    }
}

impl<T: Into<TypeRef>, B: Into<Vec<u8>>> FromIterator<(T, B)> for RedefinitionRequest {
    fn from_iter<I: IntoIterator<Item = (T, B)>>(iter: I) -> Self {
        let mut request = Self::new();
        for (target, body) in iter {
            request.push(target, body);
        }
        request
    }
}

/// Outcome of a fully applied batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedefinitionReceipt {
    /// Redefined types, in request order
    pub applied: Vec<TypeRef>,
    /// Capability the batch went through
    pub capability_id: Uuid,
    /// Whether the runtime itself guaranteed all-or-nothing application
    pub atomic: bool,
}

/// Redefinition errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RedefinitionError {
    /// No capability has been published in this process
    #[error("redefinition capability not available; bootstrap first")]
    CapabilityNotAvailable,

    #[error("redefinition batch is empty")]
    EmptyBatch,

    #[error("type `{0}` is not loaded")]
    TypeNotLoaded(TypeRef),

    /// The new body adds, removes or retypes members
    #[error("schema change rejected for `{target}`: {changes:?}")]
    SchemaChangeRejected {
        target: TypeRef,
        changes: Vec<ShapeChange>,
    },

    /// The runtime refused the batch for another reason
    #[error("runtime rejected redefinition: {source}")]
    RuntimeRedefinition {
        #[source]
        source: RedefineFailure,
    },

    /// Some pairs took effect and could not be reverted
    #[error("batch partially applied (applied: {applied:?}, failed: {failed:?}): {source}")]
    PartiallyApplied {
        applied: Vec<TypeRef>,
        failed: Vec<TypeRef>,
        #[source]
        source: Box<RedefinitionError>,
    },
}

impl RedefinitionError {
    /// Whether the same batch may succeed later
    ///
    /// True when the process has not been bootstrapped yet or a type is not
    /// loaded yet.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CapabilityNotAvailable | Self::TypeNotLoaded(_))
    }
}

impl From<RedefineFailure> for RedefinitionError {
    fn from(failure: RedefineFailure) -> Self {
        match failure {
            RedefineFailure::TypeNotLoaded(ty) => Self::TypeNotLoaded(ty),
            RedefineFailure::ShapeChanged { target, changes } => {
                Self::SchemaChangeRejected { target, changes }
            }
            RedefineFailure::PartiallyApplied { applied, source } => {
                let failed = failed_target(&source).into_iter().collect();
                Self::PartiallyApplied {
                    applied,
                    failed,
                    source: Box::new(Self::from(*source)),
                }
            }
            other => Self::RuntimeRedefinition { source: other },
        }
    }
}

fn failed_target(failure: &RedefineFailure) -> Option<TypeRef> {
    match failure {
        RedefineFailure::TypeNotLoaded(t)
        | RedefineFailure::DuplicateTarget(t)
        | RedefineFailure::ShapeChanged { target: t, .. }
        | RedefineFailure::Malformed { target: t, .. }
        | RedefineFailure::NameMismatch { target: t, .. }
        | RedefineFailure::Verification { target: t, .. } => Some(t.clone()),
        RedefineFailure::NotPermitted | RedefineFailure::PartiallyApplied { .. } => None,
    }
}

/// Executes batches through the capability held in a slot
#[derive(Debug, Clone, Copy)]
pub struct Redefiner<'a> {
    slot: &'a CapabilitySlot,
}

impl Default for Redefiner<'static> {
    fn default() -> Self {
        Self::new(&CAPABILITY)
    }
}

impl<'a> Redefiner<'a> {
    #[must_use]
    pub fn new(slot: &'a CapabilitySlot) -> Self {
        Self { slot }
    }

    /// Apply `request`
    ///
    /// Checks, in order: a capability is published, the batch is non-empty,
    /// every target is loaded. Then applies the batch.
    ///
    /// # Concurrency
    /// Concurrent calls are allowed, but callers must not race two batches
    /// on the same type. On a non-atomic runtime a failed batch restores
    /// the definitions it snapshotted, which overwrites any change another
    /// batch made to those types in between.
    ///
    /// # Errors
    /// See [`RedefinitionError`]
    pub fn redefine(
        &self,
        request: &RedefinitionRequest,
    ) -> Result<RedefinitionReceipt, RedefinitionError> {
        let capability = self
            .slot
            .get()
            .ok_or(RedefinitionError::CapabilityNotAvailable)?;
        if request.is_empty() {
            return Err(RedefinitionError::EmptyBatch);
        }
        if let Some(missing) = request.iter().find(|p| !capability.is_loaded(&p.target)) {
            return Err(RedefinitionError::TypeNotLoaded(missing.target.clone()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = request.iter().find(|p| !seen.insert(&p.target)) {
            return Err(RedefineFailure::DuplicateTarget(dup.target.clone()).into());
        }

        let batch = request.to_batch();
        let atomic = capability.is_batch_atomic();
        if atomic {
            capability.redefine_types(&batch)?;
        } else {
            apply_with_rollback(capability, &batch)?;
        }

        let applied: Vec<TypeRef> = request.iter().map(|p| p.target.clone()).collect();
        tracing::info!(
            types = applied.len(),
            atomic,
            capability = %capability.id(),
            "redefinition batch applied"
        );
        Ok(RedefinitionReceipt {
            applied,
            capability_id: capability.id(),
            atomic,
        })
    }
}

/// Apply `request` through the process-wide capability
///
/// The same concurrency rule as [`Redefiner::redefine`] applies: do not
/// redefine one type from two threads at once.
///
/// # Errors
/// See [`Redefiner::redefine`]
pub fn redefine(request: &RedefinitionRequest) -> Result<RedefinitionReceipt, RedefinitionError> {
    Redefiner::default().redefine(request)
}

/// What the rollback path needs from a capability
trait RedefineTarget {
    fn current_definition(&self, ty: &TypeRef) -> Option<Vec<u8>>;
    fn redefine_types(&self, batch: &[TypeRedefinition]) -> Result<(), RedefineFailure>;
}

impl RedefineTarget for RedefineCapability {
    fn current_definition(&self, ty: &TypeRef) -> Option<Vec<u8>> {
        RedefineCapability::current_definition(self, ty)
    }

    fn redefine_types(&self, batch: &[TypeRedefinition]) -> Result<(), RedefineFailure> {
        RedefineCapability::redefine_types(self, batch)
    }
}

fn apply_with_rollback(
    capability: &impl RedefineTarget,
    batch: &[TypeRedefinition],
) -> Result<(), RedefinitionError> {
    let snapshots = batch
        .iter()
        .map(|pair| {
            capability
                .current_definition(&pair.target)
                .map(|bytes| TypeRedefinition::new(pair.target.clone(), bytes))
                .ok_or_else(|| RedefinitionError::TypeNotLoaded(pair.target.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    for (index, pair) in batch.iter().enumerate() {
        let Err(failure) = capability.redefine_types(std::slice::from_ref(pair)) else {
            continue;
        };

        let mut stuck = Vec::new();
        for snapshot in snapshots[..index].iter().rev() {
            if let Err(e) = capability.redefine_types(std::slice::from_ref(snapshot)) {
                tracing::error!(ty = %snapshot.target, error = %e, "rollback failed");
                stuck.push(snapshot.target.clone());
            }
        }

        let cause = RedefinitionError::from(failure);
        if stuck.is_empty() {
            tracing::warn!(
                failed = %pair.target,
                rolled_back = index,
                "redefinition failed, batch rolled back"
            );
            return Err(cause);
        }
        stuck.reverse();
        return Err(RedefinitionError::PartiallyApplied {
            applied: stuck,
            failed: vec![pair.target.clone()],
            source: Box::new(cause),
        });
    }
    Ok(())
}
