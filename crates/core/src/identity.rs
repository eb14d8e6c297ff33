//! Entity identity state machine.
//!
//! ```text
//! transient ──register──▶ managed ──commit──▶ persisted ──register──▶ managed …
//! ```
//!
//! A unit of work owns the instances it manages; rollback drops them. A copy
//! cloned while its instance was managed still reads `managed` after that unit
//! has finished. [`Tracked::detach`] resets such a copy to `transient` (never
//! stored) or `persisted` before it is registered again.
//!
//! The `id` may be absent (pending) until the first successful commit. Once a
//! commit has assigned it, it never changes.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{EntityId, InstanceKey};

/// Lifecycle state of an in-memory entity instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityState {
    /// Not tracked by any unit of work.
    Transient,
    /// Tracked by exactly one active unit of work.
    Managed,
    /// Committed; may be tracked again by a new unit of work.
    Persisted,
}

/// An entity's business fields plus the identity metadata the unit of work needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Tracked<E> {
    instance: InstanceKey,
    id: Option<EntityId>,
    version: u64,
    state: EntityState,
    fields: E,
}

impl<E> Tracked<E> {
    /// A new transient entity; its id is assigned at commit.
    pub fn new(fields: E) -> Self {
        Self {
            instance: InstanceKey::new(),
            id: None,
            version: 0,
            state: EntityState::Transient,
            fields,
        }
    }

    /// A new transient entity with a caller-chosen id.
    pub fn with_id(id: EntityId, fields: E) -> Self {
        Self {
            id: Some(id),
            ..Self::new(fields)
        }
    }

    /// Rebuild an entity read from storage. Always `managed` by the loader.
    pub fn loaded(id: EntityId, version: u64, fields: E) -> Self {
        Self {
            instance: InstanceKey::new(),
            id: Some(id),
            version,
            state: EntityState::Managed,
            fields,
        }
    }

    pub fn instance(&self) -> InstanceKey {
        self.instance
    }

    pub fn id(&self) -> Option<EntityId> {
        self.id
    }

    /// Last stored version (0 = never stored).
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    /// True while no id has been assigned yet.
    pub fn is_pending(&self) -> bool {
        self.id.is_none()
    }

    pub fn fields(&self) -> &E {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut E {
        &mut self.fields
    }

    pub fn into_fields(self) -> E {
        self.fields
    }

    /// `transient | persisted → managed`.
    pub fn mark_managed(&mut self) -> DomainResult<()> {
        if self.state == EntityState::Managed {
            return Err(DomainError::invariant(format!(
                "entity instance {} is already managed",
                self.instance
            )));
        }
        self.state = EntityState::Managed;
        Ok(())
    }

    /// `managed → persisted`, freezing the id on first assignment.
    pub fn mark_persisted(&mut self, id: EntityId, version: u64) -> DomainResult<()> {
        if self.state != EntityState::Managed {
            return Err(DomainError::invariant(format!(
                "entity instance {} must be managed to be persisted (state: {:?})",
                self.instance, self.state
            )));
        }
        if let Some(existing) = self.id {
            if existing != id {
                return Err(DomainError::invariant(format!(
                    "entity id is immutable: {existing} cannot become {id}"
                )));
            }
        }
        if version <= self.version {
            return Err(DomainError::invariant(format!(
                "version must advance: stored {} is not after {}",
                version, self.version
            )));
        }
        self.id = Some(id);
        self.version = version;
        self.state = EntityState::Persisted;
        Ok(())
    }

    /// Forget a `managed` state left over from a unit of work that has finished.
    pub fn detach(&mut self) {
        if self.state == EntityState::Managed {
            self.state = if self.version == 0 {
                EntityState::Transient
            } else {
                EntityState::Persisted
            };
        }
    }
}
