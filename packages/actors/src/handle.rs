//! Public entry point to a running scheduler.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use db::TriggerStore;
use ractor::{Actor, ActorRef};
use sched_core::{JobData, JobDefinition, QueueStateSnapshot, SchedulerEvent, Trigger};
use tokio::sync::broadcast;

use crate::error::SchedulerError;
use crate::job::JobRegistry;
use crate::messages::{SchedulerMessage, SchedulerStatus};
use crate::reconciler::Reconciler;
use crate::scheduler::{SchedulerActor, SchedulerArgs};

/// Cloneable handle used by producers to submit work and by the host to
/// control the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    actor: ActorRef<SchedulerMessage>,
    store: TriggerStore,
    registry: Arc<JobRegistry>,
    events: broadcast::Sender<SchedulerEvent>,
    queue_state: broadcast::Sender<QueueStateSnapshot>,
}

/// Start the scheduler, spawning its worker pool.
pub async fn start_scheduler(
    args: SchedulerArgs,
) -> Result<(SchedulerHandle, tokio::task::JoinHandle<()>), SchedulerError> {
    let store = args.store.clone();
    let registry = args.registry.clone();
    let events = args.events.clone();
    let queue_state = args.queue_state.clone();

    let (actor, handle) = Actor::spawn(None, SchedulerActor, args).await?;

    Ok((
        SchedulerHandle {
            actor,
            store,
            registry,
            events,
            queue_state,
        },
        handle,
    ))
}

impl SchedulerHandle {
    pub fn store(&self) -> &TriggerStore {
        &self.store
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// A reconciler for recurring jobs over the same store and registry.
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.store.clone(), self.registry.clone())
    }

    /// Definition for a job of a registered type.
    pub fn job_definition(
        &self,
        job_type: &str,
        data: JobData,
    ) -> Result<JobDefinition, SchedulerError> {
        let spec = self
            .registry
            .spec(job_type)
            .ok_or_else(|| SchedulerError::UnknownJobType(job_type.to_string()))?;
        Ok(JobDefinition::for_spec(spec, data))
    }

    /// Fire a job once at its type's priority. Returns the next fire time,
    /// or now if the job is already executing.
    pub async fn start_job(
        &self,
        job_type: &str,
        data: JobData,
        replace_existing: bool,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let job = self.job_definition(job_type, data)?;
        let priority = self
            .registry
            .spec(job_type)
            .map(|s| s.priority)
            .unwrap_or_default();

        let next = self.store.start_job(&job, priority, replace_existing).await?;
        self.nudge();
        Ok(next)
    }

    /// Fire a job once, ahead of ordinary work.
    pub async fn start_job_now(
        &self,
        job_type: &str,
        data: JobData,
        replace_existing: bool,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let job = self.job_definition(job_type, data)?;
        let next = self.store.start_job_now(&job, replace_existing).await?;
        self.nudge();
        Ok(next)
    }

    /// Store an arbitrary trigger for `job`.
    pub async fn schedule(
        &self,
        job: &JobDefinition,
        trigger: Trigger,
        replace_existing: bool,
        keep_schedule: bool,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        if !self.registry.contains(&job.job_type) {
            return Err(SchedulerError::UnknownJobType(job.job_type.clone()));
        }

        let next = self
            .store
            .schedule(job, trigger, replace_existing, keep_schedule)
            .await?;
        let _ = self.events.send(SchedulerEvent::JobScheduled {
            job_key: job.key.clone(),
            next_fire_time: next,
            timestamp: Utc::now(),
        });
        self.nudge();
        Ok(next)
    }

    /// Ask for a dispatch pass now instead of on the next tick.
    pub fn nudge(&self) {
        let _ = self.actor.send_message(SchedulerMessage::Tick);
    }

    /// Stop starting new jobs; running ones finish.
    pub fn pause(&self) -> Result<(), SchedulerError> {
        Ok(self.actor.send_message(SchedulerMessage::Pause)?)
    }

    pub fn resume(&self) -> Result<(), SchedulerError> {
        Ok(self.actor.send_message(SchedulerMessage::Resume)?)
    }

    pub async fn status(&self) -> Result<SchedulerStatus, SchedulerError> {
        let result = ractor::rpc::call(
            &self.actor,
            |reply| SchedulerMessage::GetStatus { reply },
            Some(Duration::from_secs(5)),
        )
        .await?;

        match result {
            ractor::rpc::CallResult::Success(status) => Ok(status),
            _ => Err(SchedulerError::ShutDown),
        }
    }

    /// Cancel running jobs and stop the scheduler. With `wait_for_jobs`,
    /// returns once every running job has returned.
    pub async fn shutdown(&self, wait_for_jobs: bool) -> Result<(), SchedulerError> {
        let result = ractor::rpc::call(
            &self.actor,
            |reply| SchedulerMessage::Shutdown {
                wait_for_jobs,
                reply: Some(reply),
            },
            None,
        )
        .await?;

        match result {
            ractor::rpc::CallResult::Success(()) => Ok(()),
            // The actor stopped before replying.
            ractor::rpc::CallResult::SenderError => Ok(()),
            ractor::rpc::CallResult::Timeout => Err(SchedulerError::ShutDown),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_queue_state(&self) -> broadcast::Receiver<QueueStateSnapshot> {
        self.queue_state.subscribe()
    }
}
