//! Core domain types for the background job scheduler.
//!
//! This crate contains shared types used across all packages:
//! - JobKey, JobDefinition and JobSpec for units of work
//! - Trigger and Schedule for when work may start
//! - QueueState derivation for observability
//! - Events for real-time updates
//! - CommandResult for the legacy command processor

mod command;
mod events;
mod job;
mod queue_state;
mod trigger;

pub use command::{CommandResult, CommandStatus};
pub use events::SchedulerEvent;
pub use job::{
    FiredId, JobData, JobDefinition, JobKey, JobResult, JobSpec, Priority, RemoteService,
};
pub use queue_state::{
    ActiveJob, ProcessorSnapshot, QueueStateEventArgs, QueueStateSnapshot, QueueStateStruct,
    QueueStatus, WorkCategory,
};
pub use trigger::{IntervalUnit, Schedule, ScheduleKind, Trigger, TriggerError, TriggerKey, TriggerState};
