//! Job trait and registry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sched_core::{FiredId, JobData, JobDefinition, JobResult, JobSpec, QueueStateStruct};
use tokio_util::sync::CancellationToken;

use crate::error::JobError;

/// Result type for job bodies.
pub type JobOutput = Result<JobResult, JobError>;

/// Future type for async job bodies.
pub type JobFuture = Pin<Box<dyn Future<Output = JobOutput> + Send>>;

/// What a running job gets to see.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: JobDefinition,
    pub fired_id: FiredId,
    pub scheduled_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(
        job: JobDefinition,
        fired_id: FiredId,
        scheduled_at: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job,
            fired_id,
            scheduled_at,
            cancel,
        }
    }

    pub fn data(&self) -> &JobData {
        &self.job.data
    }

    /// A string field of the payload.
    pub fn str_param(&self, name: &str) -> Option<&str> {
        self.job.data.get(name).and_then(|v| v.as_str())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the scheduler asks this job to stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// A job type: its static spec and the body that runs it.
pub trait Job: Send + Sync + 'static {
    fn spec(&self) -> &JobSpec;

    fn run(&self, ctx: JobContext) -> JobFuture;

    /// Queue state shown while a job with `data` runs.
    fn describe(&self, _data: &JobData) -> QueueStateStruct {
        QueueStateStruct::new(self.spec().category, Vec::new())
    }
}

/// Maps job types to their bodies.
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<dyn Job>>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.jobs.keys()).finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
        }
    }

    /// Register a job type. A later registration of the same type wins.
    pub fn register<J: Job>(&mut self, job: J) {
        let job_type = job.spec().job_type.clone();
        if self.jobs.insert(job_type.clone(), Arc::new(job)).is_some() {
            tracing::warn!("Job type {} registered twice", job_type);
        }
    }

    pub fn with<J: Job>(mut self, job: J) -> Self {
        self.register(job);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn Job>> {
        self.jobs.get(job_type).cloned()
    }

    pub fn spec(&self, job_type: &str) -> Option<&JobSpec> {
        self.jobs.get(job_type).map(|j| j.spec())
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.jobs.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<&str> {
        self.jobs.keys().map(|s| s.as_str()).collect()
    }
}

type Describe = Box<dyn Fn(&JobData) -> Vec<String> + Send + Sync>;

/// A closure-backed job type.
pub struct FnJob<F>
where
    F: Fn(JobContext) -> JobFuture + Send + Sync + 'static,
{
    spec: JobSpec,
    params: Option<Describe>,
    body: F,
}

impl<F> FnJob<F>
where
    F: Fn(JobContext) -> JobFuture + Send + Sync + 'static,
{
    pub fn new(spec: JobSpec, body: F) -> Self {
        Self {
            spec,
            params: None,
            body,
        }
    }

    /// Fill the category template from the payload.
    pub fn with_params(
        mut self,
        params: impl Fn(&JobData) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        self.params = Some(Box::new(params));
        self
    }
}

impl<F> Job for FnJob<F>
where
    F: Fn(JobContext) -> JobFuture + Send + Sync + 'static,
{
    fn spec(&self) -> &JobSpec {
        &self.spec
    }

    fn run(&self, ctx: JobContext) -> JobFuture {
        (self.body)(ctx)
    }

    fn describe(&self, data: &JobData) -> QueueStateStruct {
        let params = self.params.as_ref().map(|p| p(data)).unwrap_or_default();
        QueueStateStruct::new(self.spec.category, params)
    }
}

/// Build an [`FnJob`] from an async block.
///
/// ```ignore
/// let job = fn_job!(spec, |ctx| {
///     do_work(ctx.data()).await?;
///     Ok(JobResult::new("done"))
/// });
/// ```
#[macro_export]
macro_rules! fn_job {
    ($spec:expr, |$ctx:ident| $body:expr) => {
        $crate::FnJob::new($spec, |$ctx: $crate::JobContext| {
            Box::pin(async move { $body })
        })
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use sched_core::WorkCategory;
    use serde_json::json;

    fn hashing() -> impl Job {
        FnJob::new(JobSpec::new("HashFile", WorkCategory::HashingFile), |ctx| {
            Box::pin(async move {
                let path = ctx.str_param("path").unwrap_or_default().to_string();
                Ok(JobResult::new(format!("hashed {}", path)))
            })
        })
        .with_params(|data| {
            vec![
                data.get("path")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            ]
        })
    }

    #[test]
    fn registry_lookup() {
        let registry = JobRegistry::new().with(hashing());

        assert!(registry.contains("HashFile"));
        assert!(registry.get("Missing").is_none());
        assert_eq!(
            registry.spec("HashFile").map(|s| s.category),
            Some(WorkCategory::HashingFile)
        );
    }

    #[test]
    fn describe_fills_template() {
        let job = hashing();
        let mut data = JobData::new();
        data.insert("path".to_string(), json!("/media/a.mkv"));

        assert_eq!(job.describe(&data).format_message(), "Hashing file: /media/a.mkv");
    }

    #[tokio::test]
    async fn body_sees_payload_and_cancellation() {
        let job = hashing();
        let mut data = JobData::new();
        data.insert("path".to_string(), json!("x"));
        let definition = JobDefinition::new("HashFile", "test", data);
        let cancel = CancellationToken::new();
        let ctx = JobContext::new(definition, FiredId::new(), Utc::now(), cancel.clone());

        assert!(!ctx.is_cancelled());
        cancel.cancel();
        assert!(ctx.is_cancelled());

        let result = job.run(ctx).await.expect("job succeeds");
        assert_eq!(result.summary, "hashed x");
    }
}
