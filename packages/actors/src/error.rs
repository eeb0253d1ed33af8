//! Error types for the scheduler actors.

use db::DbError;

use crate::settings::SettingsError;

/// Why a job body did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    #[error("job was cancelled")]
    Cancelled,

    #[error("job panicked: {0}")]
    Panicked(String),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        JobError::Failed(message.into())
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        JobError::Failed(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        JobError::Failed(message.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Store error: {0}")]
    Store(#[from] DbError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Failed to spawn actor: {0}")]
    Spawn(#[from] ractor::SpawnErr),

    #[error("Messaging error: {0}")]
    Messaging(String),

    #[error("No job registered for type {0}")]
    UnknownJobType(String),

    #[error("Scheduler is shut down")]
    ShutDown,
}

impl<T> From<ractor::MessagingErr<T>> for SchedulerError {
    fn from(err: ractor::MessagingErr<T>) -> Self {
        SchedulerError::Messaging(err.to_string())
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
