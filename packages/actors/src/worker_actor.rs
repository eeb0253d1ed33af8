//! Worker actor for executing jobs.

use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::error::{JobError, panic_message};
use crate::job::JobContext;
use crate::messages::{DispatchedJob, JobOutcome, SchedulerMessage, WorkerMessage};

/// State for the worker actor.
pub struct WorkerActorState {
    pub worker_id: String,
    pub scheduler: ActorRef<SchedulerMessage>,
    /// Jobs run by this worker so far.
    pub processed: u64,
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    pub scheduler: ActorRef<SchedulerMessage>,
}

/// Runs one job at a time and reports back to the scheduler.
///
/// A panicking job body is caught here and reported as a failure, so the
/// worker stays available for the next job.
pub struct WorkerActor;

async fn execute(dispatched: DispatchedJob) -> JobOutcome {
    let DispatchedJob { fired, job, cancel } = dispatched;
    let ctx = JobContext::new(fired.job.clone(), fired.id, fired.scheduled_at, cancel.clone());

    let result = AssertUnwindSafe(async move { job.run(ctx).await })
        .catch_unwind()
        .await;

    match result {
        Ok(Ok(job_result)) => JobOutcome::Completed(job_result),
        Ok(Err(_)) if cancel.is_cancelled() => JobOutcome::Failed(JobError::Cancelled),
        Ok(Err(error)) => JobOutcome::Failed(error),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!("Job {} panicked: {}", fired.job.key, message);
            JobOutcome::Failed(JobError::Panicked(message))
        }
    }
}

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!("Starting worker: {}", args.worker_id);

        Ok(WorkerActorState {
            worker_id: args.worker_id,
            scheduler: args.scheduler,
            processed: 0,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::ProcessJob { job } => {
                let fired_id = job.fired.id;
                tracing::debug!(
                    "Worker {} running job {} ({})",
                    state.worker_id,
                    job.fired.job.key,
                    job.fired.job.job_type
                );

                let outcome = execute(*job).await;
                state.processed += 1;

                state.scheduler.send_message(SchedulerMessage::JobFinished {
                    fired_id,
                    worker_id: state.worker_id.clone(),
                    outcome,
                })?;
            }

            WorkerMessage::Shutdown => {
                tracing::debug!(
                    "Shutting down worker {} after {} job(s)",
                    state.worker_id,
                    state.processed
                );
                myself.stop(None);
            }
        }

        Ok(())
    }
}
