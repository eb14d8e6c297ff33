use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::debug;

use serde_json::Value as JsonValue;

use commitbox_core::{EntityId, ExpectedVersion};

use super::{RowWrite, Storage, StorageError, StoredRow, TxnHandle};
use crate::outbox::{DispatchMark, OutboxRow, OutboxStatus, OutboxStore};

/// A point where [`InMemoryStorage`] can be told to fail once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultPoint {
    Begin,
    /// Any write to the named table.
    WriteRow { table: String },
    AllocateSequence,
    InsertOutbox,
    Commit,
}

impl FaultPoint {
    pub fn write_row(table: impl Into<String>) -> Self {
        FaultPoint::WriteRow {
            table: table.into(),
        }
    }
}

/// A row write buffered by one transaction.
#[derive(Debug)]
struct StagedWrite {
    /// Precondition against the committed row, from the first write to this key.
    expected: ExpectedVersion,
    /// Version the row carries once the transaction commits.
    version: u64,
    body: JsonValue,
}

#[derive(Debug, Default)]
struct TxnBuffer {
    writes: BTreeMap<(String, EntityId), StagedWrite>,
    outbox: Vec<OutboxRow>,
    /// Counter values this transaction will publish on commit.
    counters: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct EngineState {
    next_txn: u64,
    tables: HashMap<String, BTreeMap<EntityId, StoredRow>>,
    outbox: BTreeMap<u64, OutboxRow>,
    counters: HashMap<String, u64>,
    /// Scope -> transaction currently holding its sequence lock.
    sequence_holders: HashMap<String, TxnHandle>,
    open: HashMap<TxnHandle, TxnBuffer>,
}

impl EngineState {
    fn committed_version(&self, table: &str, key: EntityId) -> Option<u64> {
        self.tables
            .get(table)
            .and_then(|rows| rows.get(&key))
            .map(|row| row.version)
    }

    fn release_sequences(&mut self, txn: TxnHandle) -> bool {
        let before = self.sequence_holders.len();
        self.sequence_holders.retain(|_, holder| *holder != txn);
        before != self.sequence_holders.len()
    }
}

/// In-memory transactional engine.
///
/// Intended for tests/dev. Writes are buffered per transaction and applied
/// under a single lock on commit, so readers never see partial state.
/// Version preconditions are checked when staged and again at commit.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    state: Mutex<EngineState>,
    sequence_released: Condvar,
    faults: Mutex<Vec<FaultPoint>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next operation that reaches `point` (one-shot).
    pub fn inject_fault(&self, point: FaultPoint) {
        self.faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(point);
    }

    pub fn clear_faults(&self) {
        self.faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// Committed rows of `table`, ordered by key.
    pub fn committed_rows(&self, table: &str) -> Vec<StoredRow> {
        self.state
            .lock()
            .map(|s| {
                s.tables
                    .get(table)
                    .map(|rows| rows.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Every committed outbox row, ordered by sequence.
    pub fn committed_outbox(&self) -> Vec<OutboxRow> {
        self.state
            .lock()
            .map(|s| s.outbox.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn open_transactions(&self) -> usize {
        self.state.lock().map(|s| s.open.len()).unwrap_or_default()
    }

    fn trip(&self, hit: impl Fn(&FaultPoint) -> bool) -> Result<(), StorageError> {
        let mut faults = self.faults.lock().map_err(|_| StorageError::Poisoned)?;
        if let Some(idx) = faults.iter().position(hit) {
            let fault = faults.remove(idx);
            return Err(StorageError::Injected(format!("{fault:?}")));
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, EngineState>, StorageError> {
        self.state.lock().map_err(|_| StorageError::Poisoned)
    }
}

fn buffer(state: &mut EngineState, txn: TxnHandle) -> Result<&mut TxnBuffer, StorageError> {
    state
        .open
        .get_mut(&txn)
        .ok_or(StorageError::UnknownTransaction(txn))
}

impl Storage for InMemoryStorage {
    fn begin(&self) -> Result<TxnHandle, StorageError> {
        self.trip(|f| *f == FaultPoint::Begin)?;

        let mut state = self.lock()?;
        state.next_txn += 1;
        let txn = TxnHandle::from_raw(state.next_txn);
        state.open.insert(txn, TxnBuffer::default());
        Ok(txn)
    }

    fn read_row(
        &self,
        txn: TxnHandle,
        table: &str,
        key: EntityId,
    ) -> Result<Option<StoredRow>, StorageError> {
        let mut state = self.lock()?;
        if let Some(staged) = buffer(&mut state, txn)?.writes.get(&(table.to_string(), key)) {
            return Ok(Some(StoredRow {
                key,
                version: staged.version,
                body: staged.body.clone(),
            }));
        }
        Ok(state.tables.get(table).and_then(|rows| rows.get(&key)).cloned())
    }

    fn write_row(
        &self,
        txn: TxnHandle,
        table: &str,
        key: EntityId,
        write: RowWrite,
    ) -> Result<u64, StorageError> {
        self.trip(|f| matches!(f, FaultPoint::WriteRow { table: t } if t == table))?;

        let mut state = self.lock()?;
        let slot = (table.to_string(), key);
        // A key already written by this transaction is checked against that write.
        let staged = buffer(&mut state, txn)?
            .writes
            .get(&slot)
            .map(|staged| (staged.expected, staged.version));
        let (precondition, actual) = match staged {
            Some((first, version)) => (first, Some(version)),
            None => (write.expected, state.committed_version(table, key)),
        };
        if !write.expected.matches(actual) {
            return Err(StorageError::Conflict {
                table: table.to_string(),
                key,
                expected: write.expected,
                actual,
            });
        }

        let version = write.next_version();
        buffer(&mut state, txn)?.writes.insert(
            slot,
            StagedWrite {
                expected: precondition,
                version,
                body: write.body,
            },
        );
        Ok(version)
    }

    fn allocate_sequence(
        &self,
        txn: TxnHandle,
        scope: &str,
        count: u64,
        timeout: Duration,
    ) -> Result<Range<u64>, StorageError> {
        self.trip(|f| *f == FaultPoint::AllocateSequence)?;

        let started = Instant::now();
        let deadline = started + timeout;
        let mut state = self.lock()?;

        loop {
            buffer(&mut state, txn)?;
            match state.sequence_holders.get(scope).copied() {
                Some(holder) if holder != txn => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(StorageError::LockTimeout {
                            scope: scope.to_string(),
                            waited: now - started,
                        });
                    }
                    let (guard, _) = self
                        .sequence_released
                        .wait_timeout(state, deadline - now)
                        .map_err(|_| StorageError::Poisoned)?;
                    state = guard;
                }
                _ => break,
            }
        }

        state.sequence_holders.insert(scope.to_string(), txn);
        let committed = state.counters.get(scope).copied().unwrap_or(0);
        let buf = buffer(&mut state, txn)?;
        let last = buf.counters.entry(scope.to_string()).or_insert(committed);
        let start = *last + 1;
        *last += count;
        Ok(start..start + count)
    }

    fn commit(&self, txn: TxnHandle) -> Result<(), StorageError> {
        self.trip(|f| *f == FaultPoint::Commit)?;

        let mut state = self.lock()?;
        let buf = state
            .open
            .remove(&txn)
            .ok_or(StorageError::UnknownTransaction(txn))?;

        // Re-validate against rows committed since each write was staged.
        for ((table, key), write) in &buf.writes {
            let actual = state.committed_version(table, *key);
            if !write.expected.matches(actual) {
                if state.release_sequences(txn) {
                    self.sequence_released.notify_all();
                }
                return Err(StorageError::Conflict {
                    table: table.clone(),
                    key: *key,
                    expected: write.expected,
                    actual,
                });
            }
        }

        let write_count = buf.writes.len();
        let outbox_count = buf.outbox.len();
        for ((table, key), write) in buf.writes {
            let row = StoredRow {
                key,
                version: write.version,
                body: write.body,
            };
            state.tables.entry(table).or_default().insert(key, row);
        }
        for row in buf.outbox {
            state.outbox.insert(row.sequence, row);
        }
        for (scope, last) in buf.counters {
            state.counters.insert(scope, last);
        }
        if state.release_sequences(txn) {
            self.sequence_released.notify_all();
        }

        debug!(%txn, write_count, outbox_count, "in-memory transaction committed");
        Ok(())
    }

    fn rollback(&self, txn: TxnHandle) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        let known = state.open.remove(&txn).is_some();
        if state.release_sequences(txn) {
            self.sequence_released.notify_all();
        }
        if known {
            Ok(())
        } else {
            Err(StorageError::UnknownTransaction(txn))
        }
    }
}

impl OutboxStore for InMemoryStorage {
    fn insert_outbox_rows(&self, txn: TxnHandle, rows: &[OutboxRow]) -> Result<(), StorageError> {
        self.trip(|f| *f == FaultPoint::InsertOutbox)?;

        let mut state = self.lock()?;
        for row in rows {
            if state.outbox.contains_key(&row.sequence) {
                return Err(StorageError::Backend(format!(
                    "duplicate outbox sequence {}",
                    row.sequence
                )));
            }
        }
        buffer(&mut state, txn)?.outbox.extend_from_slice(rows);
        Ok(())
    }

    fn pending_outbox_rows(&self, limit: usize) -> Result<Vec<OutboxRow>, StorageError> {
        let state = self.lock()?;
        Ok(state
            .outbox
            .values()
            .filter(|row| row.status == OutboxStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    fn set_dispatched(&self, sequence: u64, at: DateTime<Utc>) -> Result<DispatchMark, StorageError> {
        let mut state = self.lock()?;
        let Some(row) = state.outbox.get_mut(&sequence) else {
            return Ok(DispatchMark::Unknown);
        };
        if row.status == OutboxStatus::Dispatched {
            return Ok(DispatchMark::AlreadyDispatched);
        }
        row.status = OutboxStatus::Dispatched;
        row.dispatched_at = Some(at);
        Ok(DispatchMark::Marked)
    }

    fn count_pending(&self) -> Result<u64, StorageError> {
        let state = self.lock()?;
        Ok(state
            .outbox
            .values()
            .filter(|row| row.status == OutboxStatus::Pending)
            .count() as u64)
    }
}
