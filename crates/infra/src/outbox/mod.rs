//! Transactional event outbox.
//!
//! Domain events become durable in the **same storage transaction** as the
//! entity writes that produced them. A dispatcher later drains pending rows in
//! `sequence` order and marks them dispatched after delivery.
//!
//! ## Ordering
//!
//! Sequence numbers come from the storage engine's serialized `outbox`
//! counter, allocated during commit and held until the transaction finishes.
//! They are contiguous within one transaction and follow commit order across
//! transactions, so consumers must order by `sequence`, never by `occurred_at`.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use commitbox_core::EntityId;
use commitbox_events::DomainEventRecord;

use crate::storage::{Storage, StorageError, TxnHandle};

/// Counter scope the outbox allocates sequence numbers from.
pub const OUTBOX_SEQUENCE_SCOPE: &str = "outbox";

/// Delivery status of an outbox row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Dispatched,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Dispatched => "dispatched",
        }
    }
}

impl FromStr for OutboxStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "dispatched" => Ok(OutboxStatus::Dispatched),
            other => Err(StorageError::Backend(format!("invalid outbox status: {other}"))),
        }
    }
}

/// One durable outbox entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRow {
    /// Commit-order position; the only field consumers may order by.
    pub sequence: u64,
    pub event_id: Uuid,
    pub event_type: String,
    pub schema_version: u32,
    pub payload: JsonValue,
    /// Business time captured when the event was created.
    pub occurred_at: DateTime<Utc>,
    /// Resolved id of the entity that produced the event.
    pub correlates_with: Option<EntityId>,
    pub status: OutboxStatus,
    /// When the row was staged by the committing unit of work.
    pub recorded_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl OutboxRow {
    pub fn is_pending(&self) -> bool {
        self.status == OutboxStatus::Pending
    }
}

/// An event record whose correlation has been resolved to a concrete id.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEvent {
    pub record: DomainEventRecord,
    pub correlates_with: Option<EntityId>,
}

/// Result of a `set_dispatched` call against the store.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DispatchMark {
    Marked,
    AlreadyDispatched,
    Unknown,
}

/// Outbox persistence, implemented by the same engine as [`Storage`] so that
/// inserts share the entity writes' transaction.
pub trait OutboxStore: Send + Sync {
    /// Stage rows inside `txn`; they become visible only when `txn` commits.
    fn insert_outbox_rows(&self, txn: TxnHandle, rows: &[OutboxRow]) -> Result<(), StorageError>;

    /// Committed pending rows, `sequence` ascending, at most `limit`.
    fn pending_outbox_rows(&self, limit: usize) -> Result<Vec<OutboxRow>, StorageError>;

    /// Move a committed row to `dispatched`.
    fn set_dispatched(&self, sequence: u64, at: DateTime<Utc>) -> Result<DispatchMark, StorageError>;

    fn count_pending(&self) -> Result<u64, StorageError>;
}

impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    fn insert_outbox_rows(&self, txn: TxnHandle, rows: &[OutboxRow]) -> Result<(), StorageError> {
        (**self).insert_outbox_rows(txn, rows)
    }

    fn pending_outbox_rows(&self, limit: usize) -> Result<Vec<OutboxRow>, StorageError> {
        (**self).pending_outbox_rows(limit)
    }

    fn set_dispatched(&self, sequence: u64, at: DateTime<Utc>) -> Result<DispatchMark, StorageError> {
        (**self).set_dispatched(sequence, at)
    }

    fn count_pending(&self) -> Result<u64, StorageError> {
        (**self).count_pending()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutboxError {
    #[error("no outbox row with sequence {0}")]
    UnknownSequence(u64),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Outbox facade over a storage engine.
#[derive(Debug)]
pub struct EventOutbox<S> {
    storage: Arc<S>,
}

impl<S> Clone for EventOutbox<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
        }
    }
}

impl<S> EventOutbox<S>
where
    S: Storage + OutboxStore,
{
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Stage one row per event inside the caller's transaction.
    ///
    /// Only the unit of work calls this, during commit, with the same
    /// transaction handle its entity writes used.
    pub(crate) fn append_within_transaction(
        &self,
        events: Vec<ResolvedEvent>,
        txn: TxnHandle,
        lock_timeout: Duration,
    ) -> Result<Vec<OutboxRow>, StorageError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let sequences = self.storage.allocate_sequence(
            txn,
            OUTBOX_SEQUENCE_SCOPE,
            events.len() as u64,
            lock_timeout,
        )?;
        if sequences.end - sequences.start != events.len() as u64 {
            return Err(StorageError::Backend(format!(
                "sequence allocation returned {} numbers for {} events",
                sequences.end - sequences.start,
                events.len()
            )));
        }

        let recorded_at = Utc::now();
        let rows: Vec<OutboxRow> = sequences
            .zip(events)
            .map(|(sequence, event)| OutboxRow {
                sequence,
                event_id: event.record.event_id(),
                event_type: event.record.event_type().to_string(),
                schema_version: event.record.schema_version(),
                payload: event.record.payload().clone(),
                occurred_at: event.record.occurred_at(),
                correlates_with: event.correlates_with,
                status: OutboxStatus::Pending,
                recorded_at,
                dispatched_at: None,
            })
            .collect();

        self.storage.insert_outbox_rows(txn, &rows)?;
        debug!(
            %txn,
            first_sequence = rows[0].sequence,
            count = rows.len(),
            "staged outbox rows"
        );
        Ok(rows)
    }

    /// Up to `limit` committed pending rows, oldest sequence first. Read-only.
    pub fn drain_pending(&self, limit: usize) -> Result<Vec<OutboxRow>, OutboxError> {
        if limit == 0 {
            return Ok(vec![]);
        }
        Ok(self.storage.pending_outbox_rows(limit)?)
    }

    /// Mark a row dispatched. Marking an already dispatched row is a no-op.
    pub fn mark_dispatched(&self, sequence: u64) -> Result<(), OutboxError> {
        match self.storage.set_dispatched(sequence, Utc::now())? {
            DispatchMark::Marked => {
                debug!(sequence, "outbox row dispatched");
                Ok(())
            }
            DispatchMark::AlreadyDispatched => {
                debug!(sequence, "outbox row already dispatched");
                Ok(())
            }
            DispatchMark::Unknown => Err(OutboxError::UnknownSequence(sequence)),
        }
    }

    pub fn pending_count(&self) -> Result<u64, OutboxError> {
        Ok(self.storage.count_pending()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use commitbox_events::Correlation;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn event(kind: &str, correlates_with: Option<EntityId>) -> ResolvedEvent {
        ResolvedEvent {
            record: DomainEventRecord::new(kind, json!({ "kind": kind }), Correlation::None),
            correlates_with,
        }
    }

    fn append_committed(
        storage: &Arc<InMemoryStorage>,
        outbox: &EventOutbox<InMemoryStorage>,
        events: Vec<ResolvedEvent>,
    ) -> Vec<OutboxRow> {
        let txn = storage.begin().unwrap();
        let rows = outbox.append_within_transaction(events, txn, TIMEOUT).unwrap();
        storage.commit(txn).unwrap();
        rows
    }

    #[test]
    fn rows_get_contiguous_sequences_in_event_order() {
        let storage = Arc::new(InMemoryStorage::new());
        let outbox = EventOutbox::new(storage.clone());
        let id = EntityId::new();

        let rows = append_committed(
            &storage,
            &outbox,
            vec![event("A", Some(id)), event("B", None), event("C", None)],
        );

        let sequences: Vec<u64> = rows.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(rows[0].correlates_with, Some(id));
        assert!(rows.iter().all(OutboxRow::is_pending));
    }

    #[test]
    fn uncommitted_rows_are_not_drained() {
        let storage = Arc::new(InMemoryStorage::new());
        let outbox = EventOutbox::new(storage.clone());

        let txn = storage.begin().unwrap();
        outbox
            .append_within_transaction(vec![event("A", None)], txn, TIMEOUT)
            .unwrap();

        assert!(outbox.drain_pending(10).unwrap().is_empty());
        storage.rollback(txn).unwrap();
        assert!(outbox.drain_pending(10).unwrap().is_empty());
        assert_eq!(outbox.pending_count().unwrap(), 0);
    }

    #[test]
    fn drain_is_ordered_limited_and_read_only() {
        let storage = Arc::new(InMemoryStorage::new());
        let outbox = EventOutbox::new(storage.clone());
        append_committed(&storage, &outbox, vec![event("A", None), event("B", None)]);
        append_committed(&storage, &outbox, vec![event("C", None)]);

        let first = outbox.drain_pending(2).unwrap();
        let types: Vec<&str> = first.iter().map(|r| r.event_type.as_str()).collect();
        assert_eq!(types, vec!["A", "B"]);

        // Draining does not consume.
        assert_eq!(outbox.drain_pending(10).unwrap().len(), 3);
        assert!(outbox.drain_pending(0).unwrap().is_empty());
    }

    #[test]
    fn mark_dispatched_is_idempotent() {
        let storage = Arc::new(InMemoryStorage::new());
        let outbox = EventOutbox::new(storage.clone());
        let rows = append_committed(&storage, &outbox, vec![event("A", None), event("B", None)]);

        outbox.mark_dispatched(rows[0].sequence).unwrap();
        outbox.mark_dispatched(rows[0].sequence).unwrap();

        let pending = outbox.drain_pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sequence, rows[1].sequence);

        let dispatched = storage.committed_outbox();
        assert_eq!(dispatched[0].status, OutboxStatus::Dispatched);
        assert!(dispatched[0].dispatched_at.is_some());
    }

    #[test]
    fn marking_an_unknown_sequence_fails() {
        let storage = Arc::new(InMemoryStorage::new());
        let outbox = EventOutbox::new(storage);
        assert_eq!(
            outbox.mark_dispatched(42).unwrap_err(),
            OutboxError::UnknownSequence(42)
        );
    }

    #[test]
    fn empty_append_allocates_nothing() {
        let storage = Arc::new(InMemoryStorage::new());
        let outbox = EventOutbox::new(storage.clone());
        assert!(append_committed(&storage, &outbox, vec![]).is_empty());

        let rows = append_committed(&storage, &outbox, vec![event("A", None)]);
        assert_eq!(rows[0].sequence, 1);
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [OutboxStatus::Pending, OutboxStatus::Dispatched] {
            assert_eq!(status.as_str().parse::<OutboxStatus>().unwrap(), status);
        }
        assert!("lost".parse::<OutboxStatus>().is_err());
    }
}
