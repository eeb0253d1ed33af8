//! Backoff policy for store I/O.

use std::future::Future;
use std::time::Duration;

use crate::DbError;

/// How store operations are retried when the backend is unreachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Try once, never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op`, retrying transient failures with exponential backoff.
    pub async fn run<T, F, Fut>(&self, name: &str, mut op: F) -> Result<T, DbError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff_for(attempt);
                    tracing::warn!(
                        "Store operation '{}' failed (attempt {}/{}), retrying in {:?}: {}",
                        name,
                        attempt,
                        self.max_attempts,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(350));
        assert_eq!(policy.backoff_for(30), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result = policy
            .run("flaky", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DbError::LockTimeout("trigger_access".into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.ok(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<(), _> = policy
            .run("bad", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DbError::Query("syntax".into()))
            })
            .await;

        assert!(matches!(result, Err(DbError::Query(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
