//! Result types for the legacy command processor.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Finished,
    Error,
    Cancelled,
}

/// Outcome of running a legacy command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Display form of the error that caused an `Error` result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl CommandResult {
    pub fn finished() -> Self {
        Self {
            status: CommandStatus::Finished,
            message: None,
            cause: None,
        }
    }

    pub fn error(message: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self {
            status: CommandStatus::Error,
            message: Some(message.into()),
            cause: Some(cause.to_string()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: CommandStatus::Cancelled,
            message: None,
            cause: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == CommandStatus::Error
    }
}
