//! The reader/writer section guarding trigger-store mutation.

use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shared by every component that touches the trigger store.
///
/// Existence and schedule checks take the shared side; schedule, replace
/// and delete take the exclusive side. Guards must never be held across a
/// backoff sleep or external I/O unrelated to the store.
#[derive(Debug, Clone, Default)]
pub struct SchedulerLock {
    inner: Arc<RwLock<()>>,
}

impl SchedulerLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.write().await
    }
}
