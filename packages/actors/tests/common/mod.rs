#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use actors::{FnJob, Job, JobFuture, SchedulerSettings};
use db::{DbError, RetryPolicy, SchedulerLock, StoreConfig, TriggerStore};
use sched_core::{JobData, JobResult, JobSpec};
use serde_json::Value;
use tokio::time::Instant;

/// Settings tuned for fast tests.
pub fn fast_settings(pool_size: usize) -> SchedulerSettings {
    SchedulerSettings {
        store_retry: RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
        },
        ..SchedulerSettings::default()
    }
    .with_pool_size(pool_size)
    .with_tick_interval(Duration::from_millis(20))
    .with_filter_recheck(Duration::from_millis(100))
    .with_job_retries(2, Duration::from_millis(50))
}

/// A fresh in-memory store; every call gets its own datastore.
pub async fn setup_store(settings: &SchedulerSettings) -> Result<TriggerStore, DbError> {
    TriggerStore::open(
        &StoreConfig::memory(),
        SchedulerLock::new(),
        settings.store_options(),
    )
    .await
}

pub fn data(pairs: &[(&str, Value)]) -> JobData {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Counts runs and the most runs seen at once.
#[derive(Debug, Default)]
pub struct Tracker {
    current: AtomicUsize,
    peak: AtomicUsize,
    runs: AtomicUsize,
}

impl Tracker {
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }
}

/// A job that holds for `hold` and reports to `tracker`.
pub fn tracked_job(spec: JobSpec, tracker: Arc<Tracker>, hold: Duration) -> impl Job {
    FnJob::new(spec, move |_ctx| -> JobFuture {
        let tracker = tracker.clone();
        Box::pin(async move {
            tracker.enter();
            tokio::time::sleep(hold).await;
            tracker.exit();
            Ok(JobResult::new("done"))
        })
    })
}
