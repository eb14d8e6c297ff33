//! Infrastructure layer: storage engines, the event outbox, units of work,
//! configuration and background workers.

pub mod config;
pub mod outbox;
pub mod persistence;
pub mod storage;
pub mod unit_of_work;
pub mod workers;


pub use config::{Backend, ConfigError, StorageConfig, UnitOfWorkConfig};
pub use outbox::{EventOutbox, OutboxError, OutboxRow, OutboxStatus, OutboxStore};
pub use persistence::Persistence;
pub use storage::{InMemoryStorage, PostgresStorage, Storage, StorageError, TxnHandle};
pub use unit_of_work::{CommitReceipt, EntityRef, UnitOfWork, UnitOfWorkError};
