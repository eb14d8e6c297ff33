//! Which active unit of work manages which entity instance.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use commitbox_core::InstanceKey;

/// Identity of one unit-of-work transaction (fresh per `begin`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u64);

impl core::fmt::Display for UnitId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "uow-{}", self.0)
    }
}

/// Shared lease table.
///
/// A lease is taken when an instance is registered or loaded and released
/// when the owning unit commits or rolls back.
#[derive(Debug, Default)]
pub struct LeaseRegistry {
    next_unit: AtomicU64,
    leases: Mutex<HashMap<InstanceKey, UnitId>>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_unit(&self) -> UnitId {
        UnitId(self.next_unit.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Lease `instance` to `unit`; returns the current holder if taken.
    pub fn acquire(&self, instance: InstanceKey, unit: UnitId) -> Result<(), UnitId> {
        // The map holds no invariants a panicking holder could break.
        let mut leases = self
            .leases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match leases.get(&instance) {
            Some(holder) => Err(*holder),
            None => {
                leases.insert(instance, unit);
                Ok(())
            }
        }
    }

    /// Release every lease `unit` holds on `instances`.
    pub fn release<I>(&self, unit: UnitId, instances: I)
    where
        I: IntoIterator<Item = InstanceKey>,
    {
        let mut leases = self
            .leases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for instance in instances {
            if leases.get(&instance) == Some(&unit) {
                leases.remove(&instance);
            }
        }
    }

    pub fn holder(&self, instance: InstanceKey) -> Option<UnitId> {
        self.leases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&instance)
            .copied()
    }

    pub fn active_leases(&self) -> usize {
        self.leases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
