//! Actor system for the job scheduler.
//!
//! This crate provides the Ractor-based dispatcher that runs stored triggers,
//! plus the legacy in-memory command processor.
//!
//! # Architecture
//!
//! - `SchedulerActor` - Claims due triggers, applies filters and concurrency
//!   groups, and owns the worker pool
//! - `WorkerActor` - Runs one job at a time, isolating panics
//! - `CommandProcessor` - Legacy priority queue of in-memory commands
//!
//! # Usage
//!
//! ```ignore
//! use actors::{JobRegistry, SchedulerArgs, SchedulerSettings, start_scheduler};
//!
//! let registry = JobRegistry::new().with(my_job);
//! let args = SchedulerArgs::new(store, registry, SchedulerSettings::from_env()?);
//! let (scheduler, handle) = start_scheduler(args).await?;
//!
//! scheduler.start_job("HashFile", data, false).await?;
//! ```

pub mod builtin;
mod concurrency;
mod error;
mod filters;
mod handle;
mod job;
mod legacy;
mod messages;
mod reconciler;
mod reporter;
mod scheduler;
mod settings;
mod worker_actor;

pub use concurrency::{CapacityDenied, ConcurrencyGroups, ConcurrencyPermit};
pub use error::{JobError, SchedulerError};
pub use filters::{
    AcquisitionFilter, Admission, DatabaseRequiredFilter, DatabaseState, FilterChain,
    FilterDecision, NetworkRequiredFilter, NetworkState, RateLimitedFilter, Readiness,
    default_filters,
};
pub use handle::{SchedulerHandle, start_scheduler};
pub use job::{FnJob, Job, JobContext, JobFuture, JobOutput, JobRegistry};
pub use legacy::{
    CommandFuture, CommandProcessor, CommandProcessorHandle, CommandRequest, FnCommand,
};
pub use messages::{
    CommandMessage, CommandQueueState, JobOutcome, SchedulerMessage, SchedulerStatus,
    WorkerMessage,
};
pub use reconciler::{ReconcileOutcome, Reconciler, RecurringJob};
pub use reporter::QueueStateReporter;
pub use scheduler::{SchedulerActor, SchedulerArgs};
pub use settings::{EnvSettings, SchedulerSettings, SettingsError, SettingsProvider};
pub use worker_actor::WorkerActor;

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort};
