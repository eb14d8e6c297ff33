//! Immutable domain event records staged by a unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use commitbox_core::{EntityId, InstanceKey, Tracked};

use crate::event::Event;

/// Which entity (if any) an event record is about.
///
/// `Instance` is used while the entity's id is still pending; the unit of work
/// swaps it for the id assigned at commit.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Correlation {
    /// System-level event, not tied to an entity.
    None,
    /// Entity with a known id.
    Entity(EntityId),
    /// Entity instance whose id is assigned at commit.
    Instance(InstanceKey),
}

impl Correlation {
    /// Correlation for a tracked entity in whatever state it is in.
    pub fn of<E>(entity: &Tracked<E>) -> Self {
        match entity.id() {
            Some(id) => Correlation::Entity(id),
            None => Correlation::Instance(entity.instance()),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Correlation::Instance(_))
    }
}

/// A fact describing something that happened, carried to consumers through the outbox.
///
/// Fields are private: once constructed a record cannot change. The payload is
/// opaque to the persistence core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEventRecord {
    event_id: Uuid,
    event_type: String,
    schema_version: u32,
    payload: JsonValue,
    occurred_at: DateTime<Utc>,
    correlates_with: Correlation,
}

impl DomainEventRecord {
    /// Build a record from an untyped payload; `occurred_at` is captured now.
    pub fn new(
        event_type: impl Into<String>,
        payload: JsonValue,
        correlates_with: Correlation,
    ) -> Self {
        Self::occurred(event_type, 1, payload, Utc::now(), correlates_with)
    }

    /// Build a record with every field supplied by the caller.
    pub fn occurred(
        event_type: impl Into<String>,
        schema_version: u32,
        payload: JsonValue,
        occurred_at: DateTime<Utc>,
        correlates_with: Correlation,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event_type.into(),
            schema_version,
            payload,
            occurred_at,
            correlates_with,
        }
    }

    /// Serialize a typed event, keeping its type tag, schema version and business time.
    pub fn from_event<E>(event: &E, correlates_with: Correlation) -> Result<Self, serde_json::Error>
    where
        E: Event + Serialize,
    {
        let payload = serde_json::to_value(event)?;
        Ok(Self::occurred(
            event.event_type(),
            event.version(),
            payload,
            event.occurred_at(),
            correlates_with,
        ))
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn correlates_with(&self) -> Correlation {
        self.correlates_with
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize)]
    struct NoteAdded {
        text: String,
        at: DateTime<Utc>,
    }

    impl Event for NoteAdded {
        fn event_type(&self) -> &'static str {
            "NoteAdded"
        }

        fn version(&self) -> u32 {
            2
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    #[test]
    fn correlation_follows_identity_state() {
        let pending = Tracked::new(());
        assert_eq!(Correlation::of(&pending), Correlation::Instance(pending.instance()));
        assert!(Correlation::of(&pending).is_pending());

        let id = EntityId::new();
        let known = Tracked::with_id(id, ());
        assert_eq!(Correlation::of(&known), Correlation::Entity(id));
    }

    #[test]
    fn typed_event_keeps_business_time_and_schema_version() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        let event = NoteAdded {
            text: "hi".to_string(),
            at,
        };

        let record = DomainEventRecord::from_event(&event, Correlation::None).unwrap();

        assert_eq!(record.event_type(), "NoteAdded");
        assert_eq!(record.schema_version(), 2);
        assert_eq!(record.occurred_at(), at);
        assert_eq!(record.payload()["text"], json!("hi"));
        assert_eq!(record.correlates_with(), Correlation::None);
    }

    #[test]
    fn each_record_gets_its_own_event_id() {
        let a = DomainEventRecord::new("Ping", json!({}), Correlation::None);
        let b = DomainEventRecord::new("Ping", json!({}), Correlation::None);
        assert_ne!(a.event_id(), b.event_id());
    }

    #[test]
    fn correlation_serializes_with_kind_tag() {
        let id = EntityId::new();
        let json = serde_json::to_value(Correlation::Entity(id)).unwrap();
        assert_eq!(json, json!({ "kind": "entity", "value": id.to_string() }));
        assert_eq!(
            serde_json::to_value(Correlation::None).unwrap(),
            json!({ "kind": "none" })
        );
    }
}
