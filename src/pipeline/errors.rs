//! Error types for the job pipeline
//!
//! Every fatal error raised while a job is being processed is a
//! [`RunnerError`]. The orchestrator turns it into a `FAILED` report; it never
//! escapes the claim loop.

use crate::executor::CommandError;
use crate::infrastructure::QueueError;
use thiserror::Error;

/// Errors that fail the current job
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    /// Required configuration or job field is missing or invalid
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// HTTP call to the queue, runtime agent or registry failed
    #[error("{operation} failed: {message}")]
    Transport {
        /// Which call failed (`claim`, `report`, `deploy`, ...).
        operation: String,
        /// Description of the failure.
        message: String,
    },

    /// External command failed or timed out
    #[error(transparent)]
    Command(#[from] CommandError),

    /// A remote answered with a malformed response
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Local filesystem error
    #[error("IO error: {0}")]
    Io(String),
}

impl RunnerError {
    /// Shorthand for a [`RunnerError::Precondition`]
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// Shorthand for a [`RunnerError::Transport`]
    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Short category label used in logs
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Precondition(_) => "precondition",
            Self::Transport { .. } => "transport",
            Self::Command(_) => "command",
            Self::Protocol(_) => "protocol",
            Self::Io(_) => "io",
        }
    }
}

impl From<std::io::Error> for RunnerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<QueueError> for RunnerError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Decode { .. } => Self::Protocol(err.to_string()),
            QueueError::Transport { operation, .. }
            | QueueError::HttpStatus { operation, .. }
            | QueueError::Rejected { operation, .. } => Self::Transport {
                operation: operation.to_string(),
                message: err.to_string(),
            },
        }
    }
}
