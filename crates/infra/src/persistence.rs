//! Persistence context: the one place units of work and outbox handles come from.

use std::sync::Arc;

use crate::config::UnitOfWorkConfig;
use crate::outbox::{EventOutbox, OutboxStore};
use crate::storage::Storage;
use crate::unit_of_work::{LeaseRegistry, UnitOfWork};

/// Shared by every unit of work over one storage engine.
///
/// Cloning is cheap; clones share the engine and the lease registry, so
/// double-management is detected across all of them.
#[derive(Debug)]
pub struct Persistence<S> {
    storage: Arc<S>,
    leases: Arc<LeaseRegistry>,
    config: UnitOfWorkConfig,
}

impl<S> Clone for Persistence<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            leases: self.leases.clone(),
            config: self.config,
        }
    }
}

impl<S> Persistence<S>
where
    S: Storage + OutboxStore,
{
    pub fn new(storage: Arc<S>) -> Self {
        Self::with_config(storage, UnitOfWorkConfig::default())
    }

    pub fn with_config(storage: Arc<S>, config: UnitOfWorkConfig) -> Self {
        Self {
            storage,
            leases: Arc::new(LeaseRegistry::new()),
            config,
        }
    }

    /// A fresh, inactive unit of work; call `begin()` on it.
    pub fn unit_of_work(&self) -> UnitOfWork<S> {
        UnitOfWork::new(self.storage.clone(), self.leases.clone(), self.config)
    }

    pub fn outbox(&self) -> EventOutbox<S> {
        EventOutbox::new(self.storage.clone())
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn config(&self) -> UnitOfWorkConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use commitbox_core::{Entity, Tracked};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Counter {
        value: u32,
    }

    impl Entity for Counter {
        const TABLE: &'static str = "counters";
    }

    #[test]
    fn clones_share_leases() {
        let persistence = Persistence::new(Arc::new(InMemoryStorage::new()));
        let other = persistence.clone();

        let mut a = persistence.unit_of_work();
        let mut b = other.unit_of_work();
        a.begin().unwrap();
        b.begin().unwrap();

        let counter = Tracked::new(Counter { value: 1 });
        a.register(counter.clone()).unwrap();
        assert!(b.register(counter).is_err());
    }

    #[test]
    fn units_inherit_the_configured_timeout() {
        let config = UnitOfWorkConfig {
            commit_timeout: Duration::from_millis(20),
        };
        let persistence = Persistence::with_config(Arc::new(InMemoryStorage::new()), config);
        assert_eq!(persistence.config(), config);

        let mut uow = persistence.unit_of_work();
        uow.begin().unwrap();
        uow.register(Tracked::new(Counter { value: 7 })).unwrap();
        let receipt = uow.commit().unwrap();

        assert_eq!(receipt.ids().count(), 1);
        assert_eq!(persistence.storage().committed_rows("counters").len(), 1);
        assert_eq!(persistence.outbox().pending_count().unwrap(), 0);
    }
}
