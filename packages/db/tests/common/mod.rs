#![allow(dead_code)]

use std::time::Duration;

use db::{DbError, RetryPolicy, SchedulerLock, StoreConfig, StoreOptions, TriggerStore};
use sched_core::{JobData, JobDefinition};
use serde_json::Value;

/// A fresh in-memory store; every call gets its own datastore.
pub async fn setup_store() -> Result<TriggerStore, DbError> {
    setup_store_with(StoreOptions::default()).await
}

pub async fn setup_store_with(options: StoreOptions) -> Result<TriggerStore, DbError> {
    let options = options.with_retry(RetryPolicy {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(10),
    });
    TriggerStore::open(&StoreConfig::memory(), SchedulerLock::new(), options).await
}

pub fn job(job_type: &str, pairs: &[(&str, Value)]) -> JobDefinition {
    let data: JobData = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    JobDefinition::new(job_type, "test", data)
}
