//! Background workers.

pub mod outbox_dispatcher;

use std::sync::mpsc;
use std::thread;

pub use outbox_dispatcher::{DispatchReport, DispatcherConfig, OutboxDispatcher, OutboxMessage};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(
        name: &'static str,
        shutdown: mpsc::Sender<()>,
        join: thread::JoinHandle<()>,
    ) -> Self {
        Self {
            name,
            shutdown,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}
