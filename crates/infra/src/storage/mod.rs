//! Transactional row-store boundary.
//!
//! The unit of work never talks to a database directly; it drives a
//! [`Storage`] engine through one [`TxnHandle`] per logical transaction:
//!
//! ```text
//! begin() ─▶ read_row / write_row … ─▶ allocate_sequence ─▶ commit()
//!                                                       └──▶ rollback()
//! ```
//!
//! ## Engine requirements
//!
//! Implementations must:
//! - keep a transaction's writes invisible to other transactions until `commit`
//! - apply every write of a transaction atomically on `commit`, or none of them
//! - enforce each write's [`ExpectedVersion`] against the committed row and
//!   report mismatches as [`StorageError::Conflict`]
//! - serialize `allocate_sequence` per scope until the allocating transaction
//!   finishes, so sequence numbers follow commit order
//! - release everything a transaction holds on `rollback`

pub mod in_memory;
pub mod postgres;

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;

use commitbox_core::{EntityId, ExpectedVersion};

pub use in_memory::{FaultPoint, InMemoryStorage};
pub use postgres::PostgresStorage;

/// Opaque handle to one open storage transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnHandle(u64);

impl TxnHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for TxnHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// A committed (or read-your-own-write) entity row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub key: EntityId,
    pub version: u64,
    pub body: JsonValue,
}

/// A conditional row write.
#[derive(Debug, Clone, PartialEq)]
pub struct RowWrite {
    pub expected: ExpectedVersion,
    pub body: JsonValue,
}

impl RowWrite {
    /// Version the row carries once this write commits.
    pub fn next_version(&self) -> u64 {
        self.expected.next()
    }
}

/// Storage engine failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A write's version precondition did not hold.
    #[error("write conflict on {table}/{key}: expected {expected}, found {actual:?}")]
    Conflict {
        table: String,
        key: EntityId,
        expected: ExpectedVersion,
        actual: Option<u64>,
    },

    #[error("timed out after {waited:?} waiting for the '{scope}' sequence lock")]
    LockTimeout { scope: String, waited: Duration },

    #[error("unknown or finished transaction {0}")]
    UnknownTransaction(TxnHandle),

    /// Fault injected by a test harness.
    #[error("injected fault: {0}")]
    Injected(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage lock poisoned")]
    Poisoned,
}

/// Transactional key/row store used by the unit of work.
///
/// All methods are synchronous; a unit of work is driven by a single thread.
pub trait Storage: Send + Sync {
    /// Open a new transaction.
    fn begin(&self) -> Result<TxnHandle, StorageError>;

    /// Read a row as seen by `txn` (its own pending writes included).
    fn read_row(
        &self,
        txn: TxnHandle,
        table: &str,
        key: EntityId,
    ) -> Result<Option<StoredRow>, StorageError>;

    /// Stage a conditional write; returns the version the row will carry.
    fn write_row(
        &self,
        txn: TxnHandle,
        table: &str,
        key: EntityId,
        write: RowWrite,
    ) -> Result<u64, StorageError>;

    /// Allocate `count` contiguous sequence numbers from the `scope` counter.
    ///
    /// Blocks for at most `timeout` while another transaction holds the counter.
    fn allocate_sequence(
        &self,
        txn: TxnHandle,
        scope: &str,
        count: u64,
        timeout: Duration,
    ) -> Result<Range<u64>, StorageError>;

    /// Make every staged write of `txn` durable and visible, atomically.
    fn commit(&self, txn: TxnHandle) -> Result<(), StorageError>;

    /// Discard `txn` and release everything it holds.
    fn rollback(&self, txn: TxnHandle) -> Result<(), StorageError>;
}

impl<S> Storage for Arc<S>
where
    S: Storage + ?Sized,
{
    fn begin(&self) -> Result<TxnHandle, StorageError> {
        (**self).begin()
    }

    fn read_row(
        &self,
        txn: TxnHandle,
        table: &str,
        key: EntityId,
    ) -> Result<Option<StoredRow>, StorageError> {
        (**self).read_row(txn, table, key)
    }

    fn write_row(
        &self,
        txn: TxnHandle,
        table: &str,
        key: EntityId,
        write: RowWrite,
    ) -> Result<u64, StorageError> {
        (**self).write_row(txn, table, key, write)
    }

    fn allocate_sequence(
        &self,
        txn: TxnHandle,
        scope: &str,
        count: u64,
        timeout: Duration,
    ) -> Result<Range<u64>, StorageError> {
        (**self).allocate_sequence(txn, scope, count, timeout)
    }

    fn commit(&self, txn: TxnHandle) -> Result<(), StorageError> {
        (**self).commit(txn)
    }

    fn rollback(&self, txn: TxnHandle) -> Result<(), StorageError> {
        (**self).rollback(txn)
    }
}
