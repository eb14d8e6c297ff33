use std::io;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use uuid::Uuid;

use commitbox_core::EntityId;
use commitbox_events::EventBus;

use super::WorkerHandle;
use crate::outbox::{EventOutbox, OutboxError, OutboxRow, OutboxStore};
use crate::storage::Storage;

/// What consumers receive for one committed outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Dedupe / ordering key; delivery is at-least-once.
    pub sequence: u64,
    pub event_id: Uuid,
    pub event_type: String,
    pub schema_version: u32,
    pub payload: JsonValue,
    pub occurred_at: DateTime<Utc>,
    pub correlates_with: Option<EntityId>,
}

impl From<&OutboxRow> for OutboxMessage {
    fn from(row: &OutboxRow) -> Self {
        Self {
            sequence: row.sequence,
            event_id: row.event_id,
            event_type: row.event_type.clone(),
            schema_version: row.schema_version,
            payload: row.payload.clone(),
            occurred_at: row.occurred_at,
            correlates_with: row.correlates_with,
        }
    }
}

/// Outcome of one dispatch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    /// Sequence whose publish failed; it and everything after stay pending.
    pub stopped_at: Option<u64>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub batch_size: usize,
    /// Idle wait between passes that found less than a full batch.
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Drains pending outbox rows in sequence order onto an [`EventBus`].
///
/// A row is marked dispatched only after its publish succeeded. A pass stops
/// at the first publish failure so consumers never see a later sequence
/// before an earlier one.
#[derive(Debug)]
pub struct OutboxDispatcher<S, B> {
    outbox: EventOutbox<S>,
    bus: B,
}

impl<S, B> OutboxDispatcher<S, B>
where
    S: Storage + OutboxStore,
    B: EventBus<OutboxMessage>,
{
    pub fn new(outbox: EventOutbox<S>, bus: B) -> Self {
        Self { outbox, bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Deliver up to `batch_size` pending rows.
    pub fn dispatch_once(&self, batch_size: usize) -> Result<DispatchReport, OutboxError> {
        let mut report = DispatchReport::default();

        for row in self.outbox.drain_pending(batch_size)? {
            if let Err(err) = self.bus.publish(OutboxMessage::from(&row)) {
                warn!(
                    sequence = row.sequence,
                    event_type = %row.event_type,
                    error = %err,
                    "outbox publish failed; row stays pending"
                );
                report.stopped_at = Some(row.sequence);
                break;
            }
            self.outbox.mark_dispatched(row.sequence)?;
            report.delivered += 1;
        }

        if report.delivered > 0 {
            debug!(delivered = report.delivered, "outbox dispatch pass");
        }
        Ok(report)
    }
}

impl<S, B> OutboxDispatcher<S, B>
where
    S: Storage + OutboxStore + 'static,
    B: EventBus<OutboxMessage> + 'static,
{
    /// Run dispatch passes on a background thread until shut down.
    pub fn spawn(self, name: &'static str, config: DispatcherConfig) -> io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || self.run(name, config, shutdown_rx))?;

        Ok(WorkerHandle::new(name, shutdown_tx, join))
    }

    fn run(self, name: &'static str, config: DispatcherConfig, shutdown_rx: mpsc::Receiver<()>) {
        loop {
            let busy = match self.dispatch_once(config.batch_size) {
                Ok(report) => report.stopped_at.is_none() && report.delivered == config.batch_size,
                Err(err) => {
                    warn!(worker = name, error = %err, "outbox dispatch pass failed");
                    false
                }
            };

            if busy {
                // Full batch: go again unless asked to stop.
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                continue;
            }

            match shutdown_rx.recv_timeout(config.poll_interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(worker = name, "outbox dispatcher stopped");
    }
}
