//! Job detail repository.

use sched_core::{JobData, JobDefinition, JobKey};
use serde::{Deserialize, Serialize};

use crate::{Database, DbError};

/// Repository for stored job definitions.
pub struct JobDetailRepository;

/// Row shape of `job_detail`. The payload is kept as a JSON string so the
/// table stays schemafull regardless of what jobs carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobDetailRecord {
    job_name: String,
    job_group: String,
    job_type: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    is_durable: bool,
    #[serde(default)]
    requests_recovery: bool,
    job_data: String,
}

impl JobDetailRecord {
    fn from_definition(job: &JobDefinition) -> Result<Self, DbError> {
        Ok(Self {
            job_name: job.key.name.clone(),
            job_group: job.key.group.clone(),
            job_type: job.job_type.clone(),
            description: job.description.clone(),
            is_durable: job.durable,
            requests_recovery: job.requests_recovery,
            job_data: serde_json::to_string(&job.data)?,
        })
    }

    fn into_definition(self) -> Result<JobDefinition, DbError> {
        let data: JobData = serde_json::from_str(&self.job_data)?;
        Ok(JobDefinition {
            key: JobKey::new(self.job_name, self.job_group),
            job_type: self.job_type,
            data,
            description: self.description,
            durable: self.is_durable,
            requests_recovery: self.requests_recovery,
        })
    }
}

/// Record id of a job detail row.
pub(crate) fn job_record_id(key: &JobKey) -> String {
    format!("{}::{}", key.group, key.name)
}

impl JobDetailRepository {
    /// Insert or overwrite a job definition.
    pub async fn upsert(db: &Database, job: &JobDefinition) -> Result<(), DbError> {
        let record = JobDetailRecord::from_definition(job)?;

        db.query("UPSERT type::thing('job_detail', $id) CONTENT $record")
            .bind(("id", job_record_id(&job.key)))
            .bind(("record", record))
            .await?
            .check()?;

        Ok(())
    }

    /// Get a job definition by key.
    pub async fn get(db: &Database, key: &JobKey) -> Result<Option<JobDefinition>, DbError> {
        let mut result = db
            .query("SELECT * FROM type::thing('job_detail', $id)")
            .bind(("id", job_record_id(key)))
            .await?;

        let records: Vec<JobDetailRecord> = result.take(0)?;

        records
            .into_iter()
            .next()
            .map(JobDetailRecord::into_definition)
            .transpose()
    }

    /// Check if a job definition exists.
    pub async fn exists(db: &Database, key: &JobKey) -> Result<bool, DbError> {
        Ok(Self::get(db, key).await?.is_some())
    }

    /// Delete a job definition.
    pub async fn delete(db: &Database, key: &JobKey) -> Result<(), DbError> {
        db.query("DELETE type::thing('job_detail', $id)")
            .bind(("id", job_record_id(key)))
            .await?
            .check()?;

        Ok(())
    }

    /// Delete every job definition.
    pub async fn delete_all(db: &Database) -> Result<(), DbError> {
        db.query("DELETE job_detail").await?.check()?;
        Ok(())
    }

    /// Count stored job definitions.
    pub async fn count(db: &Database) -> Result<u64, DbError> {
        let mut result = db
            .query("SELECT count() AS count FROM job_detail GROUP ALL")
            .await?;

        #[derive(Deserialize)]
        struct Count {
            count: i64,
        }

        let counts: Vec<Count> = result.take(0)?;
        Ok(counts.first().map(|c| c.count.max(0) as u64).unwrap_or(0))
    }
}
