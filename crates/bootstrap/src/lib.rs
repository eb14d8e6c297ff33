//! Bootstrap transaction: register one rider and one operator, atomically
//! with their registration events.

use anyhow::Context;
use chrono::Utc;
use tracing::info;

use commitbox_accounts::{AccountProfile, Operator, Rider};
use commitbox_core::{EntityId, Tracked};
use commitbox_infra::unit_of_work::CommitReceipt;
use commitbox_infra::{OutboxStore, Persistence, Storage};

/// What the bootstrap transaction created.
#[derive(Debug)]
pub struct Bootstrapped {
    pub rider_id: EntityId,
    pub operator_id: EntityId,
    pub receipt: CommitReceipt,
}

pub fn run<S>(persistence: &Persistence<S>) -> anyhow::Result<Bootstrapped>
where
    S: Storage + OutboxStore,
{
    let rider = Rider::new(
        AccountProfile::new("Bhaskar")
            .context("invalid rider profile")?
            .with_affiliation("Concordia"),
    );
    let operator = Operator::new(
        AccountProfile::new("BhaskarDas")
            .context("invalid operator profile")?
            .with_affiliation("Concordia"),
    );
    let now = Utc::now();
    let (rider_event, operator_event) = (rider.registered(now), operator.registered(now));

    let mut uow = persistence.unit_of_work();
    uow.begin().context("failed to begin unit of work")?;
    let rider_ref = uow.register(Tracked::new(rider))?;
    let operator_ref = uow.register(Tracked::new(operator))?;
    uow.record_for(&rider_ref, &rider_event)?;
    uow.record_for(&operator_ref, &operator_event)?;

    let receipt = uow.commit().context("bootstrap commit failed")?;
    let rider_id = receipt
        .id_of(&rider_ref)
        .context("commit receipt is missing the rider")?;
    let operator_id = receipt
        .id_of(&operator_ref)
        .context("commit receipt is missing the operator")?;

    let pending = persistence
        .outbox()
        .pending_count()
        .context("failed to count pending outbox rows")?;
    info!(
        %rider_id,
        %operator_id,
        sequences = ?receipt.outbox_rows().iter().map(|row| row.sequence).collect::<Vec<_>>(),
        pending,
        "bootstrap committed"
    );

    Ok(Bootstrapped {
        rider_id,
        operator_id,
        receipt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use commitbox_infra::InMemoryStorage;
    use commitbox_infra::storage::FaultPoint;
    use std::sync::Arc;

    #[test]
    fn bootstrap_commits_two_rows_and_two_events() {
        let persistence = Persistence::new(Arc::new(InMemoryStorage::new()));

        let done = run(&persistence).unwrap();

        let rows = done.receipt.outbox_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].correlates_with, Some(done.rider_id));
        assert_eq!(rows[1].correlates_with, Some(done.operator_id));
        assert_eq!(persistence.outbox().pending_count().unwrap(), 2);
    }

    #[test]
    fn failed_bootstrap_reports_context() {
        let persistence = Persistence::new(Arc::new(InMemoryStorage::new()));
        persistence.storage().inject_fault(FaultPoint::Commit);

        let err = run(&persistence).unwrap_err();

        assert!(format!("{err:#}").starts_with("bootstrap commit failed"));
        assert!(persistence.storage().committed_outbox().is_empty());
    }
}
