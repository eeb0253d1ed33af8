//! Fired-trigger bookkeeping and instance heartbeats.

use chrono::{DateTime, Utc};
use sched_core::{FiredId, JobKey};
use serde::{Deserialize, Serialize};

use super::{from_millis, to_millis};
use crate::{Database, DbError};

/// Repository for executions in progress.
pub struct FiredTriggerRepository;

/// One row per execution handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredTriggerRecord {
    pub entry_id: String,
    pub trigger_id: String,
    pub job_name: String,
    pub job_group: String,
    pub instance_name: String,
    pub fired_time: i64,
    pub sched_time: i64,
    pub priority: i64,
    pub state: String,
    #[serde(default)]
    pub requests_recovery: bool,
}

impl FiredTriggerRecord {
    pub fn job_key(&self) -> JobKey {
        JobKey::new(self.job_name.clone(), self.job_group.clone())
    }

    pub fn fired_at(&self) -> DateTime<Utc> {
        from_millis(self.fired_time)
    }
}

impl FiredTriggerRepository {
    pub async fn insert(db: &Database, record: &FiredTriggerRecord) -> Result<(), DbError> {
        db.query("CREATE type::thing('fired_trigger', $id) CONTENT $record")
            .bind(("id", record.entry_id.clone()))
            .bind(("record", record.clone()))
            .await?
            .check()?;

        Ok(())
    }

    pub async fn delete(db: &Database, id: FiredId) -> Result<(), DbError> {
        db.query("DELETE type::thing('fired_trigger', $id)")
            .bind(("id", id.to_string()))
            .await?
            .check()?;

        Ok(())
    }

    /// Executions in progress, oldest first.
    pub async fn list(db: &Database) -> Result<Vec<FiredTriggerRecord>, DbError> {
        let mut result = db
            .query("SELECT * FROM fired_trigger ORDER BY fired_time ASC")
            .await?;

        let records: Vec<FiredTriggerRecord> = result.take(0)?;
        Ok(records)
    }

    /// Keys of jobs with an execution in progress.
    pub async fn executing_jobs(db: &Database) -> Result<Vec<JobKey>, DbError> {
        let mut keys: Vec<JobKey> = Self::list(db)
            .await?
            .iter()
            .map(FiredTriggerRecord::job_key)
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Whether a job has an execution in progress.
    pub async fn is_executing(db: &Database, key: &JobKey) -> Result<bool, DbError> {
        let mut result = db
            .query("SELECT VALUE entry_id FROM fired_trigger WHERE job_group = $group AND job_name = $name LIMIT 1")
            .bind(("group", key.group.clone()))
            .bind(("name", key.name.clone()))
            .await?;

        let entries: Vec<String> = result.take(0)?;
        Ok(!entries.is_empty())
    }

    pub async fn delete_all(db: &Database) -> Result<(), DbError> {
        db.query("DELETE fired_trigger").await?.check()?;
        Ok(())
    }
}

/// Repository for scheduler instance heartbeats.
pub struct SchedulerStateRepository;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SchedulerStateRecord {
    instance_name: String,
    last_checkin_time: i64,
    checkin_interval: i64,
}

impl SchedulerStateRepository {
    /// Record that `instance` is alive and will check in again within `interval_ms`.
    pub async fn check_in(
        db: &Database,
        instance: &str,
        at: DateTime<Utc>,
        interval_ms: i64,
    ) -> Result<(), DbError> {
        let record = SchedulerStateRecord {
            instance_name: instance.to_string(),
            last_checkin_time: to_millis(at),
            checkin_interval: interval_ms,
        };

        db.query("UPSERT type::thing('scheduler_state', $id) CONTENT $record")
            .bind(("id", instance.to_string()))
            .bind(("record", record))
            .await?
            .check()?;

        Ok(())
    }

    /// Last check-in time of an instance, if it ever checked in.
    pub async fn last_check_in(
        db: &Database,
        instance: &str,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let mut result = db
            .query("SELECT * FROM type::thing('scheduler_state', $id)")
            .bind(("id", instance.to_string()))
            .await?;

        let records: Vec<SchedulerStateRecord> = result.take(0)?;
        Ok(records
            .into_iter()
            .next()
            .map(|r| from_millis(r.last_checkin_time)))
    }
}
