//! Repository implementations for database operations.

mod fired_repo;
mod job_repo;
mod lock_repo;
mod trigger_repo;

pub use fired_repo::{FiredTriggerRecord, FiredTriggerRepository, SchedulerStateRepository};
pub use job_repo::JobDetailRepository;
pub use lock_repo::{LockRepository, NamedLock};
pub use trigger_repo::{StoredTrigger, TriggerRepository};

use chrono::{DateTime, Utc};

/// Times are stored as epoch milliseconds so every engine orders them the same way.
pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
