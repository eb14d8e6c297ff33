use std::any::Any;
use std::fmt::Debug;

use serde_json::Value as JsonValue;

use commitbox_core::{DomainResult, Entity, EntityId, InstanceKey, Tracked};

/// Type-erased view of a managed `Tracked<E>`, so one unit can stage
/// entities of different types.
pub(crate) trait StagedEntity: Debug + Send {
    fn table(&self) -> &'static str;
    fn instance(&self) -> InstanceKey;
    fn id(&self) -> Option<EntityId>;
    fn version(&self) -> u64;
    fn body(&self) -> Result<JsonValue, serde_json::Error>;
    fn mark_persisted(&mut self, id: EntityId, version: u64) -> DomainResult<()>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<E: Entity> StagedEntity for Tracked<E> {
    fn table(&self) -> &'static str {
        E::TABLE
    }

    fn instance(&self) -> InstanceKey {
        Tracked::instance(self)
    }

    fn id(&self) -> Option<EntityId> {
        Tracked::id(self)
    }

    fn version(&self) -> u64 {
        Tracked::version(self)
    }

    fn body(&self) -> Result<JsonValue, serde_json::Error> {
        serde_json::to_value(self.fields())
    }

    fn mark_persisted(&mut self, id: EntityId, version: u64) -> DomainResult<()> {
        Tracked::mark_persisted(self, id, version)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}
