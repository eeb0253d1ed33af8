//! Event types for real-time updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{FiredId, JobKey, QueueStateSnapshot, TriggerKey};

/// Events emitted by the scheduler for real-time updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    // Store events
    /// A trigger was stored, or an identical one already existed.
    JobScheduled {
        job_key: JobKey,
        next_fire_time: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },
    /// A trigger fired later than the misfire threshold.
    TriggerMisfired {
        trigger_key: TriggerKey,
        scheduled: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    // Job events
    /// A job was handed to a worker.
    JobStarted {
        job_key: JobKey,
        fired_id: FiredId,
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A job completed successfully.
    JobCompleted {
        job_key: JobKey,
        fired_id: FiredId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A job failed.
    JobFailed {
        job_key: JobKey,
        fired_id: FiredId,
        error: String,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    /// A ready job was put back to wait for a filter or capacity.
    JobDeferred {
        job_key: JobKey,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // Processor events
    /// The derived queue state changed.
    QueueStateChanged {
        snapshot: QueueStateSnapshot,
        timestamp: DateTime<Utc>,
    },
    /// The scheduler stopped acquiring new work.
    SchedulerPaused { timestamp: DateTime<Utc> },
    /// The scheduler resumed acquiring work.
    SchedulerResumed { timestamp: DateTime<Utc> },
    /// The scheduler is shutting down.
    SchedulerShutdown { timestamp: DateTime<Utc> },
}

impl SchedulerEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SchedulerEvent::JobScheduled { timestamp, .. } => *timestamp,
            SchedulerEvent::TriggerMisfired { timestamp, .. } => *timestamp,
            SchedulerEvent::JobStarted { timestamp, .. } => *timestamp,
            SchedulerEvent::JobCompleted { timestamp, .. } => *timestamp,
            SchedulerEvent::JobFailed { timestamp, .. } => *timestamp,
            SchedulerEvent::JobDeferred { timestamp, .. } => *timestamp,
            SchedulerEvent::QueueStateChanged { timestamp, .. } => *timestamp,
            SchedulerEvent::SchedulerPaused { timestamp } => *timestamp,
            SchedulerEvent::SchedulerResumed { timestamp } => *timestamp,
            SchedulerEvent::SchedulerShutdown { timestamp } => *timestamp,
        }
    }

    /// Get the job key associated with this event, if any.
    pub fn job_key(&self) -> Option<&JobKey> {
        match self {
            SchedulerEvent::JobScheduled { job_key, .. } => Some(job_key),
            SchedulerEvent::JobStarted { job_key, .. } => Some(job_key),
            SchedulerEvent::JobCompleted { job_key, .. } => Some(job_key),
            SchedulerEvent::JobFailed { job_key, .. } => Some(job_key),
            SchedulerEvent::JobDeferred { job_key, .. } => Some(job_key),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            SchedulerEvent::JobScheduled {
                job_key,
                next_fire_time,
                ..
            } => match next_fire_time {
                Some(at) => format!("Job {} scheduled for {}", job_key, at),
                None => format!("Job {} scheduled", job_key),
            },
            SchedulerEvent::TriggerMisfired {
                trigger_key,
                scheduled,
                ..
            } => format!("Trigger {} misfired (due {})", trigger_key, scheduled),
            SchedulerEvent::JobStarted {
                job_key, worker_id, ..
            } => format!("Job {} started by {}", job_key, worker_id),
            SchedulerEvent::JobCompleted {
                job_key,
                duration_ms,
                ..
            } => format!("Job {} completed in {}ms", job_key, duration_ms),
            SchedulerEvent::JobFailed {
                job_key,
                error,
                will_retry,
                ..
            } => {
                let retry = if *will_retry { " (will retry)" } else { "" };
                format!("Job {} failed: {}{}", job_key, error, retry)
            }
            SchedulerEvent::JobDeferred {
                job_key, reason, ..
            } => format!("Job {} deferred: {}", job_key, reason),
            SchedulerEvent::QueueStateChanged { snapshot, .. } => {
                format!("Queue {}: {}", snapshot.status, snapshot.description)
            }
            SchedulerEvent::SchedulerPaused { .. } => "Scheduler paused".to_string(),
            SchedulerEvent::SchedulerResumed { .. } => "Scheduler resumed".to_string(),
            SchedulerEvent::SchedulerShutdown { .. } => "Scheduler shutting down".to_string(),
        }
    }
}
