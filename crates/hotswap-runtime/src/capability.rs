//! Redefinition capability
//!
//! A [`RedefineCapability`] is the only way to reach a runtime's
//! redefinition facility. It is granted by the agent loader to the entry
//! point of an accepted artifact and cannot be constructed elsewhere.

use crate::model::TypeRef;
use crate::registry::{RedefineFailure, TypeRedefinition, TypeRegistry};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

struct Grant {
    id: Uuid,
    agent_id: Option<String>,
    can_redefine: bool,
    granted_at: DateTime<Utc>,
    registry: Arc<TypeRegistry>,
}

/// Handle authorizing redefinition of types in one runtime
///
/// Cheap to clone; clones share identity ([`RedefineCapability::id`]).
#[derive(Clone)]
pub struct RedefineCapability {
    grant: Arc<Grant>,
}

impl RedefineCapability {
    pub(crate) fn grant(
        registry: Arc<TypeRegistry>,
        can_redefine: bool,
        agent_id: Option<String>,
    ) -> Self {
        Self {
            grant: Arc::new(Grant {
                id: Uuid::new_v4(),
                agent_id,
                can_redefine,
                granted_at: Utc::now(),
                registry,
            }),
        }
    }

    /// Identity of this grant
    #[inline]
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.grant.id
    }

    /// Agent id from the manifest of the artifact that received the grant
    #[must_use]
    pub fn agent_id(&self) -> Option<&str> {
        self.grant.agent_id.as_deref()
    }

    /// When the grant was issued
    #[must_use]
    pub fn granted_at(&self) -> DateTime<Utc> {
        self.grant.granted_at
    }

    /// Whether this grant may redefine types
    #[inline]
    #[must_use]
    pub fn is_redefine_supported(&self) -> bool {
        self.grant.can_redefine
    }

    /// Whether the runtime applies a batch all-or-nothing
    #[inline]
    #[must_use]
    pub fn is_batch_atomic(&self) -> bool {
        self.grant.registry.is_batch_atomic()
    }

    /// Whether `ty` is currently loaded
    #[must_use]
    pub fn is_loaded(&self, ty: &TypeRef) -> bool {
        self.grant.registry.is_loaded(ty)
    }

    /// Every loaded type
    #[must_use]
    pub fn loaded_types(&self) -> Vec<TypeRef> {
        self.grant.registry.loaded_types()
    }

    /// Serialized current definition of `ty`, for snapshot and rollback
    #[must_use]
    pub fn current_definition(&self, ty: &TypeRef) -> Option<Vec<u8>> {
        self.grant
            .registry
            .definition(ty)
            .and_then(|def| def.to_bytes().ok())
    }

    /// Submit a batch to the runtime's redefinition facility
    ///
    /// # Errors
    /// Returns [`RedefineFailure::NotPermitted`] if the grant lacks
    /// redefinition support, otherwise whatever the runtime rejected
    pub fn redefine_types(&self, batch: &[TypeRedefinition]) -> Result<(), RedefineFailure> {
        if !self.grant.can_redefine {
            return Err(RedefineFailure::NotPermitted);
        }
        self.grant.registry.redefine(batch)
    }

    /// Whether two handles are the same grant
    #[must_use]
    pub fn same_grant(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.grant, &other.grant)
    }
}

impl fmt::Debug for RedefineCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedefineCapability")
            .field("id", &self.grant.id)
            .field("agent_id", &self.grant.agent_id)
            .field("can_redefine", &self.grant.can_redefine)
            .field("granted_at", &self.grant.granted_at)
            .finish_non_exhaustive()
    }
}
