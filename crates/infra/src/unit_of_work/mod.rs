//! Unit of work: entity writes and domain events committed as one transaction.
//!
//! ```text
//! begin ─▶ register / load / get_mut / record_event … ─▶ commit ─▶ CommitReceipt
//!                                                     └─▶ rollback (or drop)
//! ```
//!
//! ## Commit
//!
//! Inside the unit's single storage transaction, `commit`:
//! 1. assigns a fresh id to every managed entity still pending
//! 2. resolves `Correlation::Instance` events to those ids
//! 3. writes every managed entity with an `ExpectedVersion` precondition
//! 4. appends one outbox row per event (contiguous sequence numbers)
//! 5. commits the storage transaction
//!
//! Any failure rolls the storage transaction back; nothing of the unit is
//! visible afterward and the staged entities and events are discarded. Ids are
//! applied to entities only once the storage commit succeeded. Commit is never
//! retried internally: on [`UnitOfWorkError::StaleEntity`] the caller re-runs
//! the whole operation.

mod lease;
mod staged;

pub use lease::{LeaseRegistry, UnitId};

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use commitbox_core::{Entity, EntityId, ExpectedVersion, InstanceKey, Tracked};
use commitbox_events::{Correlation, DomainEventRecord, Event};

use crate::config::UnitOfWorkConfig;
use crate::outbox::{EventOutbox, OutboxRow, OutboxStore, ResolvedEvent};
use crate::storage::{RowWrite, Storage, StorageError, TxnHandle};

use staged::StagedEntity;

#[derive(Debug, Error)]
pub enum UnitOfWorkError {
    #[error("a transaction is already active on this unit of work")]
    AlreadyActive,

    #[error("no active transaction; call begin() first")]
    NotActive,

    #[error("entity instance {instance} is already managed by an active unit of work")]
    DoubleManaged { instance: InstanceKey },

    #[error("event correlates with instance {instance}, which this unit of work does not manage")]
    UnresolvedCorrelation { instance: InstanceKey },

    /// Two instances with one id cannot be written by the same unit.
    #[error("{table}/{id} is already managed by this unit of work")]
    DuplicateId { table: &'static str, id: EntityId },

    #[error("{table}/{id} not found")]
    NotFound { table: &'static str, id: EntityId },

    /// The stored version moved since the entity was loaded (or the row
    /// already existed for an insert). Re-run the whole operation.
    #[error("stale entity {table}/{id}: expected {expected}, stored {actual:?}")]
    StaleEntity {
        table: String,
        id: EntityId,
        expected: ExpectedVersion,
        actual: Option<u64>,
    },

    #[error("commit failed: {0}")]
    CommitFailed(#[source] StorageError),

    #[error("storage error: {0}")]
    Storage(#[source] StorageError),

    #[error("failed to (de)serialize {subject}: {source}")]
    Serialization {
        subject: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl UnitOfWorkError {
    /// Only version conflicts are worth retrying (by re-running the operation).
    pub fn is_retryable(&self) -> bool {
        matches!(self, UnitOfWorkError::StaleEntity { .. })
    }
}

fn commit_error(err: StorageError) -> UnitOfWorkError {
    match err {
        StorageError::Conflict {
            table,
            key,
            expected,
            actual,
        } => UnitOfWorkError::StaleEntity {
            table,
            id: key,
            expected,
            actual,
        },
        other => UnitOfWorkError::CommitFailed(other),
    }
}

/// Typed handle to an entity managed by one unit-of-work transaction.
///
/// Valid for that transaction and for the [`CommitReceipt`] it produces.
pub struct EntityRef<E> {
    unit: UnitId,
    slot: usize,
    instance: InstanceKey,
    _entity: PhantomData<fn() -> E>,
}

impl<E> EntityRef<E> {
    pub fn instance(&self) -> InstanceKey {
        self.instance
    }

    pub fn unit(&self) -> UnitId {
        self.unit
    }
}

impl<E> Clone for EntityRef<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for EntityRef<E> {}

impl<E> core::fmt::Debug for EntityRef<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntityRef")
            .field("unit", &self.unit)
            .field("slot", &self.slot)
            .field("instance", &self.instance)
            .finish()
    }
}

#[derive(Debug, Copy, Clone)]
struct Active {
    unit: UnitId,
    txn: TxnHandle,
}

/// Groups entity writes and event records into one atomic transaction.
///
/// Single-owner: every mutating operation takes `&mut self`. Dropping an
/// active unit rolls it back.
pub struct UnitOfWork<S>
where
    S: Storage + OutboxStore,
{
    storage: Arc<S>,
    outbox: EventOutbox<S>,
    leases: Arc<LeaseRegistry>,
    config: UnitOfWorkConfig,
    active: Option<Active>,
    managed: Vec<Box<dyn StagedEntity>>,
    events: Vec<DomainEventRecord>,
}

impl<S> core::fmt::Debug for UnitOfWork<S>
where
    S: Storage + OutboxStore,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("active", &self.active)
            .field("managed", &self.managed.len())
            .field("events", &self.events.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S> UnitOfWork<S>
where
    S: Storage + OutboxStore,
{
    pub fn new(storage: Arc<S>, leases: Arc<LeaseRegistry>, config: UnitOfWorkConfig) -> Self {
        Self {
            outbox: EventOutbox::new(storage.clone()),
            storage,
            leases,
            config,
            active: None,
            managed: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn transaction(&self) -> Option<TxnHandle> {
        self.active.map(|a| a.txn)
    }

    pub fn managed_count(&self) -> usize {
        self.managed.len()
    }

    pub fn pending_events(&self) -> &[DomainEventRecord] {
        &self.events
    }

    fn current(&self) -> Result<Active, UnitOfWorkError> {
        self.active.ok_or(UnitOfWorkError::NotActive)
    }

    /// Open the storage transaction this unit writes through.
    pub fn begin(&mut self) -> Result<(), UnitOfWorkError> {
        if self.active.is_some() {
            return Err(UnitOfWorkError::AlreadyActive);
        }
        let txn = self.storage.begin().map_err(UnitOfWorkError::Storage)?;
        let unit = self.leases.next_unit();
        debug!(%unit, %txn, "unit of work started");
        self.active = Some(Active { unit, txn });
        Ok(())
    }

    /// Take ownership of an entity and manage it until commit or rollback.
    pub fn register<E: Entity>(
        &mut self,
        mut entity: Tracked<E>,
    ) -> Result<EntityRef<E>, UnitOfWorkError> {
        let Active { unit, .. } = self.current()?;
        let instance = entity.instance();

        if let Some(id) = entity.id() {
            if self.manages(E::TABLE, id) {
                return Err(UnitOfWorkError::DuplicateId { table: E::TABLE, id });
            }
        }
        if let Err(holder) = self.leases.acquire(instance, unit) {
            debug!(%instance, %holder, %unit, "rejected double registration");
            return Err(UnitOfWorkError::DoubleManaged { instance });
        }
        // The lease decides; a copy may still carry the state of a finished unit.
        entity.detach();
        if let Err(err) = entity.mark_managed() {
            self.leases.release(unit, [instance]);
            warn!(%instance, error = %err, "entity refused to become managed");
            return Err(UnitOfWorkError::DoubleManaged { instance });
        }

        debug!(%unit, table = E::TABLE, %instance, id = ?entity.id(), "entity registered");
        Ok(self.stage(unit, entity))
    }

    /// Read a stored entity through this unit's transaction.
    ///
    /// Loading an id this unit already manages returns the existing handle.
    pub fn load<E: Entity>(&mut self, id: EntityId) -> Result<EntityRef<E>, UnitOfWorkError> {
        let Active { unit, txn } = self.current()?;

        if let Some(slot) = self.managed.iter().position(|staged| {
            staged.table() == E::TABLE
                && staged.id() == Some(id)
                && staged.as_any().is::<Tracked<E>>()
        }) {
            return Ok(EntityRef {
                unit,
                slot,
                instance: self.managed[slot].instance(),
                _entity: PhantomData,
            });
        }

        let row = self
            .storage
            .read_row(txn, E::TABLE, id)
            .map_err(UnitOfWorkError::Storage)?
            .ok_or(UnitOfWorkError::NotFound {
                table: E::TABLE,
                id,
            })?;
        let fields: E =
            serde_json::from_value(row.body).map_err(|source| UnitOfWorkError::Serialization {
                subject: E::TABLE,
                source,
            })?;

        let entity = Tracked::loaded(id, row.version, fields);
        let instance = entity.instance();
        self.leases
            .acquire(instance, unit)
            .map_err(|_| UnitOfWorkError::DoubleManaged { instance })?;

        debug!(%unit, table = E::TABLE, %id, version = row.version, "entity loaded");
        Ok(self.stage(unit, entity))
    }

    fn manages(&self, table: &str, id: EntityId) -> bool {
        self.managed
            .iter()
            .any(|staged| staged.table() == table && staged.id() == Some(id))
    }

    fn stage<E: Entity>(&mut self, unit: UnitId, entity: Tracked<E>) -> EntityRef<E> {
        let handle = EntityRef {
            unit,
            slot: self.managed.len(),
            instance: entity.instance(),
            _entity: PhantomData,
        };
        self.managed.push(Box::new(entity));
        handle
    }

    fn slot<E>(&self, entity: &EntityRef<E>) -> Option<&dyn StagedEntity> {
        let active = self.active?;
        if active.unit != entity.unit {
            return None;
        }
        self.managed
            .get(entity.slot)
            .map(|staged| &**staged)
            .filter(|staged| staged.instance() == entity.instance)
    }

    /// Current state of a managed entity.
    pub fn get<E: Entity>(&self, entity: &EntityRef<E>) -> Option<&Tracked<E>> {
        self.slot(entity)?.as_any().downcast_ref()
    }

    /// Mutable business fields of a managed entity; written at commit.
    pub fn get_mut<E: Entity>(&mut self, entity: &EntityRef<E>) -> Option<&mut E> {
        self.slot(entity)?;
        self.managed
            .get_mut(entity.slot)?
            .as_any_mut()
            .downcast_mut::<Tracked<E>>()
            .map(Tracked::fields_mut)
    }

    /// Correlation for events about a managed entity.
    ///
    /// Pending entities correlate by instance; commit swaps in the new id.
    pub fn correlation<E: Entity>(&self, entity: &EntityRef<E>) -> Correlation {
        self.get(entity)
            .map(Correlation::of)
            .unwrap_or(Correlation::Instance(entity.instance))
    }

    /// Append a record to the pending events of this transaction.
    pub fn record_event(&mut self, record: DomainEventRecord) -> Result<(), UnitOfWorkError> {
        self.current()?;
        debug!(event_type = record.event_type(), event_id = %record.event_id(), "event recorded");
        self.events.push(record);
        Ok(())
    }

    /// Serialize a typed event and record it.
    pub fn record<Ev>(&mut self, event: &Ev, correlates_with: Correlation) -> Result<(), UnitOfWorkError>
    where
        Ev: Event + Serialize,
    {
        let record = DomainEventRecord::from_event(event, correlates_with).map_err(|source| {
            UnitOfWorkError::Serialization {
                subject: event.event_type(),
                source,
            }
        })?;
        self.record_event(record)
    }

    /// Record a typed event about a managed entity.
    pub fn record_for<E, Ev>(&mut self, entity: &EntityRef<E>, event: &Ev) -> Result<(), UnitOfWorkError>
    where
        E: Entity,
        Ev: Event + Serialize,
    {
        let correlates_with = self.correlation(entity);
        self.record(event, correlates_with)
    }

    /// Persist every managed entity and pending event atomically.
    pub fn commit(&mut self) -> Result<CommitReceipt, UnitOfWorkError> {
        let Active { unit, txn } = self.current()?;
        let started = Instant::now();

        let (written, rows) = match self.write_through(txn, started) {
            Ok(staged) => staged,
            Err(err) => {
                warn!(%unit, %txn, error = %err, "commit failed; rolling back");
                self.discard(unit, txn);
                return Err(err);
            }
        };

        self.active = None;
        self.events.clear();
        let managed = std::mem::take(&mut self.managed);
        self.leases.release(unit, managed.iter().map(|staged| staged.instance()));

        let mut entities = Vec::with_capacity(managed.len());
        let mut slots = Vec::with_capacity(managed.len());
        for (mut staged, (id, version)) in managed.into_iter().zip(written) {
            if let Err(err) = staged.mark_persisted(id, version) {
                warn!(%unit, %id, error = %err, "committed entity rejected its new identity");
            }
            slots.push((staged.instance(), id));
            entities.push(Some(staged));
        }

        info!(
            %unit,
            %txn,
            entities = entities.len(),
            events = rows.len(),
            first_sequence = ?rows.first().map(|row| row.sequence),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "unit of work committed"
        );

        Ok(CommitReceipt {
            unit,
            slots,
            entities,
            outbox_rows: rows,
        })
    }

    fn write_through(
        &mut self,
        txn: TxnHandle,
        started: Instant,
    ) -> Result<(Vec<(EntityId, u64)>, Vec<OutboxRow>), UnitOfWorkError> {
        let ids: Vec<EntityId> = self
            .managed
            .iter()
            .map(|staged| staged.id().unwrap_or_else(EntityId::new))
            .collect();
        let by_instance: HashMap<InstanceKey, EntityId> = self
            .managed
            .iter()
            .zip(&ids)
            .map(|(staged, id)| (staged.instance(), *id))
            .collect();

        let resolved = std::mem::take(&mut self.events)
            .into_iter()
            .map(|record| {
                let correlates_with = match record.correlates_with() {
                    Correlation::None => None,
                    Correlation::Entity(id) => Some(id),
                    Correlation::Instance(instance) => Some(
                        *by_instance
                            .get(&instance)
                            .ok_or(UnitOfWorkError::UnresolvedCorrelation { instance })?,
                    ),
                };
                Ok(ResolvedEvent {
                    record,
                    correlates_with,
                })
            })
            .collect::<Result<Vec<_>, UnitOfWorkError>>()?;

        let mut written = Vec::with_capacity(self.managed.len());
        for (staged, id) in self.managed.iter().zip(ids) {
            let body = staged
                .body()
                .map_err(|source| UnitOfWorkError::Serialization {
                    subject: staged.table(),
                    source,
                })?;
            let write = RowWrite {
                expected: ExpectedVersion::from_loaded(staged.version()),
                body,
            };
            let version = self
                .storage
                .write_row(txn, staged.table(), id, write)
                .map_err(commit_error)?;
            written.push((id, version));
        }

        let lock_budget = self.config.commit_timeout.saturating_sub(started.elapsed());
        let rows = self
            .outbox
            .append_within_transaction(resolved, txn, lock_budget)
            .map_err(commit_error)?;

        self.storage.commit(txn).map_err(commit_error)?;
        Ok((written, rows))
    }

    /// Discard staged entities and events; roll back the storage transaction if open.
    pub fn rollback(&mut self) {
        match self.active {
            Some(Active { unit, txn }) => {
                let (entities, events) = (self.managed.len(), self.events.len());
                self.discard(unit, txn);
                debug!(%unit, %txn, entities, events, "unit of work rolled back");
            }
            None => {
                self.managed.clear();
                self.events.clear();
            }
        }
    }

    fn discard(&mut self, unit: UnitId, txn: TxnHandle) {
        if let Err(err) = self.storage.rollback(txn) {
            // A failed storage commit may already have ended the transaction.
            debug!(%txn, error = %err, "storage rollback reported an error");
        }
        self.leases
            .release(unit, self.managed.iter().map(|staged| staged.instance()));
        self.managed.clear();
        self.events.clear();
        self.active = None;
    }
}

impl<S> Drop for UnitOfWork<S>
where
    S: Storage + OutboxStore,
{
    fn drop(&mut self) {
        if self.active.is_some() {
            debug!("active unit of work dropped; rolling back");
            self.rollback();
        }
    }
}

/// What a successful commit persisted.
#[derive(Debug)]
pub struct CommitReceipt {
    unit: UnitId,
    slots: Vec<(InstanceKey, EntityId)>,
    entities: Vec<Option<Box<dyn StagedEntity>>>,
    outbox_rows: Vec<OutboxRow>,
}

impl CommitReceipt {
    pub fn unit(&self) -> UnitId {
        self.unit
    }

    /// Outbox rows written by the commit, sequence ascending.
    pub fn outbox_rows(&self) -> &[OutboxRow] {
        &self.outbox_rows
    }

    /// Ids of every committed entity, in registration order.
    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.slots.iter().map(|(_, id)| *id)
    }

    pub fn id_of<E>(&self, entity: &EntityRef<E>) -> Option<EntityId> {
        if entity.unit != self.unit {
            return None;
        }
        self.slots
            .get(entity.slot)
            .filter(|(instance, _)| *instance == entity.instance)
            .map(|(_, id)| *id)
    }

    /// The persisted entity, unless already taken.
    pub fn entity<E: Entity>(&self, entity: &EntityRef<E>) -> Option<&Tracked<E>> {
        self.id_of(entity)?;
        self.entities
            .get(entity.slot)?
            .as_ref()?
            .as_any()
            .downcast_ref()
    }

    /// Move the persisted entity out, e.g. to register it with a new unit.
    pub fn take<E: Entity>(&mut self, entity: &EntityRef<E>) -> Option<Tracked<E>> {
        self.entity(entity)?;
        let staged = self.entities.get_mut(entity.slot)?.take()?;
        staged.into_any().downcast::<Tracked<E>>().ok().map(|boxed| *boxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FaultPoint, InMemoryStorage};
    use chrono::{DateTime, Utc};
    use commitbox_core::EntityState;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    impl Entity for Note {
        const TABLE: &'static str = "notes";
    }

    #[derive(Debug, Clone, Serialize)]
    struct NoteWritten {
        text: String,
        at: DateTime<Utc>,
    }

    impl Event for NoteWritten {
        fn event_type(&self) -> &'static str {
            "NoteWritten"
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    fn note(text: &str) -> Tracked<Note> {
        Tracked::new(Note {
            text: text.to_string(),
        })
    }

    fn written(text: &str) -> NoteWritten {
        NoteWritten {
            text: text.to_string(),
            at: Utc::now(),
        }
    }

    fn unit(storage: &Arc<InMemoryStorage>, leases: &Arc<LeaseRegistry>) -> UnitOfWork<InMemoryStorage> {
        UnitOfWork::new(storage.clone(), leases.clone(), UnitOfWorkConfig::default())
    }

    fn setup() -> (Arc<InMemoryStorage>, Arc<LeaseRegistry>) {
        (Arc::new(InMemoryStorage::new()), Arc::new(LeaseRegistry::new()))
    }

    #[test]
    fn operations_require_an_active_transaction() {
        let (storage, leases) = setup();
        let mut uow = unit(&storage, &leases);

        assert!(matches!(uow.register(note("a")), Err(UnitOfWorkError::NotActive)));
        assert!(matches!(uow.commit(), Err(UnitOfWorkError::NotActive)));
        assert!(matches!(
            uow.record(&written("a"), Correlation::None),
            Err(UnitOfWorkError::NotActive)
        ));

        uow.begin().unwrap();
        assert!(matches!(uow.begin(), Err(UnitOfWorkError::AlreadyActive)));
    }

    #[test]
    fn commit_assigns_ids_and_resolves_pending_correlations() {
        let (storage, leases) = setup();
        let mut uow = unit(&storage, &leases);
        uow.begin().unwrap();

        let handle = uow.register(note("hello")).unwrap();
        assert_eq!(uow.correlation(&handle), Correlation::Instance(handle.instance()));
        uow.record_for(&handle, &written("hello")).unwrap();

        let receipt = uow.commit().unwrap();
        let id = receipt.id_of(&handle).unwrap();

        assert!(!uow.is_active());
        assert_eq!(receipt.outbox_rows().len(), 1);
        assert_eq!(receipt.outbox_rows()[0].correlates_with, Some(id));

        let stored = storage.committed_rows("notes");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].key, id);
        assert_eq!(stored[0].version, 1);

        let entity = receipt.entity(&handle).unwrap();
        assert_eq!(entity.state(), EntityState::Persisted);
        assert_eq!(entity.id(), Some(id));
        assert_eq!(leases.active_leases(), 0);
    }

    #[test]
    fn same_instance_cannot_be_registered_twice() {
        let (storage, leases) = setup();
        let mut first = unit(&storage, &leases);
        let mut second = unit(&storage, &leases);
        first.begin().unwrap();
        second.begin().unwrap();

        let entity = note("shared");
        let copy = entity.clone();
        first.register(entity).unwrap();

        assert!(matches!(
            second.register(copy.clone()),
            Err(UnitOfWorkError::DoubleManaged { .. })
        ));
        assert!(matches!(
            first.register(copy.clone()),
            Err(UnitOfWorkError::DoubleManaged { .. })
        ));

        first.rollback();
        second.register(copy).unwrap();
    }

    #[test]
    fn load_returns_managed_entity_with_stored_version() {
        let (storage, leases) = setup();
        let mut uow = unit(&storage, &leases);
        uow.begin().unwrap();
        let handle = uow.register(note("v1")).unwrap();
        let id = uow.commit().unwrap().id_of(&handle).unwrap();

        uow.begin().unwrap();
        let loaded = uow.load::<Note>(id).unwrap();
        let entity = uow.get(&loaded).unwrap();
        assert_eq!(entity.state(), EntityState::Managed);
        assert_eq!(entity.version(), 1);
        assert_eq!(entity.fields().text, "v1");

        // Identity map: a second load hands back the same instance.
        let again = uow.load::<Note>(id).unwrap();
        assert_eq!(again.instance(), loaded.instance());
        assert_eq!(uow.managed_count(), 1);

        uow.get_mut(&loaded).unwrap().text = "v2".to_string();
        let receipt = uow.commit().unwrap();
        assert_eq!(receipt.entity(&loaded).unwrap().version(), 2);
        assert_eq!(storage.committed_rows("notes")[0].body["text"], "v2");
    }

    #[test]
    fn loading_a_missing_row_is_not_found() {
        let (storage, leases) = setup();
        let mut uow = unit(&storage, &leases);
        uow.begin().unwrap();
        let missing = EntityId::new();
        assert!(matches!(
            uow.load::<Note>(missing),
            Err(UnitOfWorkError::NotFound { table: "notes", id }) if id == missing
        ));
    }

    #[test]
    fn insert_over_existing_id_is_stale() {
        let (storage, leases) = setup();
        let id = EntityId::new();

        let mut uow = unit(&storage, &leases);
        uow.begin().unwrap();
        uow.register(Tracked::with_id(id, Note { text: "a".into() }))
            .unwrap();
        uow.commit().unwrap();

        uow.begin().unwrap();
        uow.register(Tracked::with_id(id, Note { text: "b".into() }))
            .unwrap();
        let err = uow.commit().unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            UnitOfWorkError::StaleEntity {
                expected: ExpectedVersion::Absent,
                actual: Some(1),
                ..
            }
        ));
    }

    #[test]
    fn two_instances_with_one_id_are_rejected() {
        let (storage, leases) = setup();
        let id = EntityId::new();
        let mut uow = unit(&storage, &leases);
        uow.begin().unwrap();

        uow.register(Tracked::with_id(id, Note { text: "first".into() }))
            .unwrap();
        assert!(matches!(
            uow.register(Tracked::with_id(id, Note { text: "second".into() })),
            Err(UnitOfWorkError::DuplicateId { table: "notes", id: dup }) if dup == id
        ));
        assert_eq!(uow.managed_count(), 1);
        assert_eq!(leases.active_leases(), 1);

        uow.commit().unwrap();
        let rows = storage.committed_rows("notes");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].body["text"], "first");
    }

    #[test]
    fn copy_of_a_managed_entity_registers_once_its_unit_ends() {
        let (storage, leases) = setup();
        let mut uow = unit(&storage, &leases);
        uow.begin().unwrap();
        let handle = uow.register(note("v1")).unwrap();
        let id = uow.commit().unwrap().id_of(&handle).unwrap();

        uow.begin().unwrap();
        let loaded = uow.load::<Note>(id).unwrap();
        let mut copy = uow.get(&loaded).unwrap().clone();
        assert_eq!(copy.state(), EntityState::Managed);

        let mut other = unit(&storage, &leases);
        other.begin().unwrap();
        assert!(matches!(
            other.register(copy.clone()),
            Err(UnitOfWorkError::DoubleManaged { .. })
        ));

        uow.rollback();
        copy.fields_mut().text = "v2".to_string();
        let again = other.register(copy).unwrap();
        assert_eq!(other.get(&again).unwrap().state(), EntityState::Managed);
        let receipt = other.commit().unwrap();
        assert_eq!(receipt.entity(&again).unwrap().version(), 2);
        assert_eq!(storage.committed_rows("notes")[0].body["text"], "v2");
    }

    #[test]
    fn later_commit_gets_later_sequences_whatever_the_begin_order() {
        let (storage, leases) = setup();
        let mut early = unit(&storage, &leases);
        let mut late = unit(&storage, &leases);

        early.begin().unwrap();
        early.record(&written("staged first"), Correlation::None).unwrap();
        late.begin().unwrap();
        late.record(&written("staged second"), Correlation::None).unwrap();

        let first_committed = late.commit().unwrap();
        let second_committed = early.commit().unwrap();

        assert_eq!(first_committed.outbox_rows()[0].sequence, 1);
        assert_eq!(second_committed.outbox_rows()[0].sequence, 2);
        assert!(second_committed.outbox_rows()[0].sequence > first_committed.outbox_rows()[0].sequence);
    }

    #[test]
    fn unknown_instance_correlation_fails_without_writes() {
        let (storage, leases) = setup();
        let mut uow = unit(&storage, &leases);
        uow.begin().unwrap();
        uow.register(note("kept")).unwrap();
        let stranger = note("never registered");
        uow.record(&written("x"), Correlation::of(&stranger)).unwrap();

        assert!(matches!(
            uow.commit(),
            Err(UnitOfWorkError::UnresolvedCorrelation { instance }) if instance == stranger.instance()
        ));
        assert!(storage.committed_rows("notes").is_empty());
        assert!(storage.committed_outbox().is_empty());
        assert_eq!(storage.open_transactions(), 0);
    }

    #[test]
    fn storage_failure_discards_everything() {
        let (storage, leases) = setup();
        let mut uow = unit(&storage, &leases);
        uow.begin().unwrap();
        let handle = uow.register(note("lost")).unwrap();
        uow.record_for(&handle, &written("lost")).unwrap();
        storage.inject_fault(FaultPoint::InsertOutbox);

        assert!(matches!(
            uow.commit(),
            Err(UnitOfWorkError::CommitFailed(StorageError::Injected(_)))
        ));
        assert!(storage.committed_rows("notes").is_empty());
        assert!(storage.committed_outbox().is_empty());
        assert_eq!(uow.managed_count(), 0);
        assert!(uow.pending_events().is_empty());
        assert_eq!(leases.active_leases(), 0);
    }

    #[test]
    fn lock_wait_is_bounded_by_commit_timeout() {
        let (storage, leases) = setup();
        let holder = storage.begin().unwrap();
        storage
            .allocate_sequence(holder, "outbox", 1, Duration::from_millis(10))
            .unwrap();

        let mut uow = UnitOfWork::new(
            storage.clone(),
            leases,
            UnitOfWorkConfig {
                commit_timeout: Duration::from_millis(50),
            },
        );
        uow.begin().unwrap();
        uow.record(&written("late"), Correlation::None).unwrap();

        assert!(matches!(
            uow.commit(),
            Err(UnitOfWorkError::CommitFailed(StorageError::LockTimeout { .. }))
        ));
        storage.rollback(holder).unwrap();
    }

    #[test]
    fn dropping_an_active_unit_rolls_back() {
        let (storage, leases) = setup();
        {
            let mut uow = unit(&storage, &leases);
            uow.begin().unwrap();
            uow.register(note("dropped")).unwrap();
            assert_eq!(storage.open_transactions(), 1);
        }
        assert_eq!(storage.open_transactions(), 0);
        assert_eq!(leases.active_leases(), 0);
    }

    #[test]
    fn handles_do_not_outlive_their_transaction() {
        let (storage, leases) = setup();
        let mut uow = unit(&storage, &leases);
        uow.begin().unwrap();
        let old = uow.register(note("old")).unwrap();
        uow.rollback();

        uow.begin().unwrap();
        uow.register(note("new")).unwrap();
        assert!(uow.get(&old).is_none());
        assert_eq!(uow.correlation(&old), Correlation::Instance(old.instance()));
    }

    #[test]
    fn receipt_hands_entities_back_for_reuse() {
        let (storage, leases) = setup();
        let mut uow = unit(&storage, &leases);
        uow.begin().unwrap();
        let handle = uow.register(note("reuse")).unwrap();
        let mut receipt = uow.commit().unwrap();

        let entity = receipt.take(&handle).unwrap();
        assert!(receipt.take(&handle).is_none());
        let first_id = receipt.id_of(&handle).unwrap();

        uow.begin().unwrap();
        let again = uow.register(entity).unwrap();
        uow.get_mut(&again).unwrap().text = "reused".to_string();
        let receipt = uow.commit().unwrap();
        assert_eq!(receipt.entity(&again).unwrap().version(), 2);
        assert_eq!(receipt.id_of(&again), Some(first_id));
        assert_eq!(receipt.id_of(&handle), None);
    }
}
