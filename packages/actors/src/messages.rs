//! Message types for actor communication.

use std::sync::Arc;

use db::FiredTrigger;
use ractor::RpcReplyPort;
use sched_core::{CommandResult, FiredId, JobResult, QueueStateSnapshot};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::job::Job;
use crate::legacy::CommandRequest;

/// Messages for the SchedulerActor.
#[derive(Debug)]
pub enum SchedulerMessage {
    /// Look for due triggers and hand them to idle workers.
    Tick,

    /// Record that this instance is alive.
    Heartbeat,

    /// A worker finished (or gave up on) a job.
    JobFinished {
        fired_id: FiredId,
        worker_id: String,
        outcome: JobOutcome,
    },

    /// Stop acquiring new work. Running jobs finish.
    Pause,

    /// Start acquiring work again.
    Resume,

    GetStatus {
        reply: RpcReplyPort<SchedulerStatus>,
    },

    /// Cancel running jobs and stop. With `wait_for_jobs`, the reply is sent
    /// once they have returned.
    Shutdown {
        wait_for_jobs: bool,
        reply: Option<RpcReplyPort<()>>,
    },
}

/// How a job execution ended.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(JobResult),
    Failed(JobError),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Completed(_))
    }
}

/// Live view of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub paused: bool,
    pub shutting_down: bool,
    pub pool_size: usize,
    pub idle_workers: usize,
    pub running: usize,
    /// Triggers currently held back by a filter or a concurrency limit.
    pub deferred: usize,
    pub queue_state: QueueStateSnapshot,
}

/// A fired trigger on its way to a worker.
pub struct DispatchedJob {
    pub fired: FiredTrigger,
    pub job: Arc<dyn Job>,
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for DispatchedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchedJob")
            .field("fired_id", &self.fired.id)
            .field("job_key", &self.fired.job.key)
            .field("job_type", &self.fired.job.job_type)
            .finish()
    }
}

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Run a job to completion.
    ProcessJob { job: Box<DispatchedJob> },

    /// Stop after the current job.
    Shutdown,
}

/// Messages for the legacy CommandProcessor.
pub enum CommandMessage {
    /// Queue a command. Replies `false` if a command with the same id is
    /// already queued or running.
    Enqueue {
        command: Arc<dyn CommandRequest>,
        reply: Option<RpcReplyPort<bool>>,
    },

    /// A running command returned.
    Finished { id: String, result: CommandResult },

    Pause,

    Resume,

    /// Drop every queued command. Replies with how many were dropped.
    Clear { reply: Option<RpcReplyPort<usize>> },

    GetState {
        reply: RpcReplyPort<CommandQueueState>,
    },

    Shutdown,
}

impl std::fmt::Debug for CommandMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandMessage::Enqueue { command, .. } => {
                f.debug_struct("Enqueue").field("id", &command.id()).finish()
            }
            CommandMessage::Finished { id, result } => f
                .debug_struct("Finished")
                .field("id", id)
                .field("result", result)
                .finish(),
            CommandMessage::Pause => f.write_str("Pause"),
            CommandMessage::Resume => f.write_str("Resume"),
            CommandMessage::Clear { .. } => f.write_str("Clear"),
            CommandMessage::GetState { .. } => f.write_str("GetState"),
            CommandMessage::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Live view of the legacy processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandQueueState {
    pub paused: bool,
    pub queued: Vec<String>,
    pub running: Vec<String>,
    pub queue_state: QueueStateSnapshot,
}
