//! Named locks shared by every scheduler instance using the same store.

use std::time::Duration;

use chrono::Utc;

use super::to_millis;
use crate::{Database, DbError};

/// Critical sections serialized across instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedLock {
    /// Trigger acquisition.
    TriggerAccess,
    /// Recovery and heartbeat bookkeeping.
    StateAccess,
}

impl NamedLock {
    pub const ALL: [NamedLock; 2] = [NamedLock::TriggerAccess, NamedLock::StateAccess];

    pub fn as_str(&self) -> &'static str {
        match self {
            NamedLock::TriggerAccess => "trigger_access",
            NamedLock::StateAccess => "state_access",
        }
    }
}

/// Repository for named lock rows.
pub struct LockRepository;

impl LockRepository {
    /// Claim `lock` for `holder`. A lock held longer than `stale_after` is
    /// considered abandoned and may be taken over.
    pub async fn try_acquire(
        db: &Database,
        lock: NamedLock,
        holder: &str,
        stale_after: Duration,
    ) -> Result<bool, DbError> {
        let now = Utc::now();
        let stale_before = to_millis(now) - stale_after.as_millis() as i64;

        let mut result = db
            .query(
                r#"
                UPDATE type::thing('named_lock', $name)
                SET holder = $holder, acquired_at = $now
                WHERE holder = NONE OR acquired_at < $stale_before
                RETURN VALUE lock_name
                "#,
            )
            .bind(("name", lock.as_str()))
            .bind(("holder", holder.to_string()))
            .bind(("now", to_millis(now)))
            .bind(("stale_before", stale_before))
            .await?;

        let claimed: Vec<String> = result.take(0)?;
        Ok(!claimed.is_empty())
    }

    /// Claim `lock`, polling until `timeout` elapses.
    pub async fn acquire(
        db: &Database,
        lock: NamedLock,
        holder: &str,
        stale_after: Duration,
        timeout: Duration,
    ) -> Result<(), DbError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if Self::try_acquire(db, lock, holder, stale_after).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DbError::LockTimeout(lock.as_str().to_string()));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Release `lock` if `holder` still owns it.
    pub async fn release(db: &Database, lock: NamedLock, holder: &str) -> Result<(), DbError> {
        db.query(
            "UPDATE type::thing('named_lock', $name) SET holder = NONE, acquired_at = NONE WHERE holder = $holder",
        )
        .bind(("name", lock.as_str()))
        .bind(("holder", holder.to_string()))
        .await?
        .check()?;

        Ok(())
    }
}
