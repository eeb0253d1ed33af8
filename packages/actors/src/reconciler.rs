//! Recurring-job reconciler.
//!
//! Brings the store in line with the recurring jobs a process declares at
//! startup: each one ends up with exactly one trigger, created when missing
//! and replaced only when the declaration asks for it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use db::TriggerStore;
use sched_core::{JobData, JobDefinition, Priority, Schedule, Trigger};

use crate::error::SchedulerError;
use crate::job::JobRegistry;

/// A recurring job as declared by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurringJob {
    pub job_type: String,
    pub data: JobData,
    pub schedule: Schedule,
    pub priority: Priority,
    /// Overwrite an existing trigger with this declaration.
    pub replace: bool,
    /// When replacing, keep the existing trigger's next fire time.
    pub keep_schedule: bool,
}

impl RecurringJob {
    pub fn new(job_type: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            job_type: job_type.into(),
            data: JobData::new(),
            schedule,
            priority: Priority::RECURRING,
            replace: false,
            keep_schedule: false,
        }
    }

    pub fn with_data(mut self, data: JobData) -> Self {
        self.data = data;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn replace(mut self, keep_schedule: bool) -> Self {
        self.replace = true;
        self.keep_schedule = keep_schedule;
        self
    }
}

/// What reconciling one recurring job did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created { next_fire: Option<DateTime<Utc>> },
    Unchanged { next_fire: Option<DateTime<Utc>> },
    Replaced { next_fire: Option<DateTime<Utc>> },
}

impl ReconcileOutcome {
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        match self {
            ReconcileOutcome::Created { next_fire }
            | ReconcileOutcome::Unchanged { next_fire }
            | ReconcileOutcome::Replaced { next_fire } => *next_fire,
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: TriggerStore,
    registry: Arc<JobRegistry>,
}

impl Reconciler {
    pub fn new(store: TriggerStore, registry: Arc<JobRegistry>) -> Self {
        Self { store, registry }
    }

    /// Make sure `recurring` has exactly one trigger.
    ///
    /// A freshly created interval trigger fires immediately, then on its
    /// schedule; a cron trigger waits for its first matching slot.
    pub async fn reconcile(
        &self,
        recurring: &RecurringJob,
    ) -> Result<ReconcileOutcome, SchedulerError> {
        recurring.schedule.validate().map_err(db::DbError::from)?;
        let spec = self
            .registry
            .spec(&recurring.job_type)
            .ok_or_else(|| SchedulerError::UnknownJobType(recurring.job_type.clone()))?;

        let job = JobDefinition::for_spec(spec, recurring.data.clone());
        let existing = self.store.triggers_for_job(&job.key).await?.len();

        // Collapse duplicates left by older versions onto one trigger.
        let (replace, keep_schedule) = if existing > 1 && !recurring.replace {
            tracing::warn!(
                "Recurring job {} has {} triggers; keeping one",
                job.key,
                existing
            );
            (true, true)
        } else {
            (recurring.replace, recurring.keep_schedule)
        };

        let trigger =
            Trigger::new(&job.key, recurring.schedule.clone()).with_priority(recurring.priority);
        let next_fire = self
            .store
            .schedule(&job, trigger, replace, keep_schedule)
            .await?;

        let outcome = match (existing, replace) {
            (0, _) => ReconcileOutcome::Created { next_fire },
            (_, true) => ReconcileOutcome::Replaced { next_fire },
            (_, false) => ReconcileOutcome::Unchanged { next_fire },
        };
        tracing::info!(
            "Recurring job {} ({}): {:?}",
            recurring.job_type,
            job.key,
            outcome
        );
        Ok(outcome)
    }

    /// Reconcile every declaration, stopping at the first failure.
    pub async fn reconcile_all(
        &self,
        jobs: &[RecurringJob],
    ) -> Result<Vec<ReconcileOutcome>, SchedulerError> {
        let mut outcomes = Vec::with_capacity(jobs.len());
        for recurring in jobs {
            outcomes.push(self.reconcile(recurring).await?);
        }
        Ok(outcomes)
    }
}
