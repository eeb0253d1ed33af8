//! Queue state reporting.

use sched_core::{ProcessorSnapshot, QueueStateSnapshot};
use tokio::sync::broadcast;

/// Derives the observable state of one processor and pushes it to
/// subscribers whenever it changes.
///
/// Owned by the processor's actor, so every publish sees the processor's
/// counters at a single point in time. Subscribers may see the same snapshot
/// more than once after they lag and resubscribe.
#[derive(Debug)]
pub struct QueueStateReporter {
    name: String,
    tx: broadcast::Sender<QueueStateSnapshot>,
    last: QueueStateSnapshot,
}

impl QueueStateReporter {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self::with_sender(name, tx)
    }

    pub fn with_sender(name: impl Into<String>, tx: broadcast::Sender<QueueStateSnapshot>) -> Self {
        Self {
            name: name.into(),
            tx,
            last: QueueStateSnapshot::idle(),
        }
    }

    pub fn sender(&self) -> broadcast::Sender<QueueStateSnapshot> {
        self.tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueStateSnapshot> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> &QueueStateSnapshot {
        &self.last
    }

    /// Re-derive the state from `processor`. Returns the new snapshot if it
    /// differs from the last one published.
    pub fn publish(&mut self, processor: &ProcessorSnapshot) -> Option<QueueStateSnapshot> {
        let snapshot = QueueStateSnapshot::from_processor(processor);
        if snapshot == self.last {
            return None;
        }

        tracing::debug!(
            "{} queue {}: {}",
            self.name,
            snapshot.status,
            snapshot.description
        );
        self.last = snapshot.clone();
        // No receivers is fine.
        let _ = self.tx.send(snapshot.clone());
        Some(snapshot)
    }
}
