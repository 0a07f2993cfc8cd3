//! Typed error hierarchy for devjobs.
//!
//! Two top-level enums cover the two halves:
//! - `JobError`: registry, runner and server-side failures
//! - `ClientError`: transport failures seen by the stream and poll consumers
//!
//! A command exiting non-zero or timing out is *not* an error here; those are
//! job outcomes carried by `JobStatus` and `FailureKind`.

use devjobs_common::JobId;
use thiserror::Error;

/// Errors from the job registry, the command runner and the HTTP handlers.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: JobId },

    #[error("Offset {offset} does not fall on a character boundary")]
    InvalidOffset { offset: usize },

    #[error("Unknown build target '{target}'")]
    UnknownTarget { target: String },

    #[error("Too many running jobs (limit {limit})")]
    TooManyJobs { limit: usize },

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced to client-side consumers of the job endpoints.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Transient(String),

    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Invalid client configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Whether a poll that failed with this error should simply be retried on
    /// the next tick.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Server { status, .. } => *status >= 500,
            Self::NotFound { .. } | Self::NotAuthorized(_) | Self::Config(_) => false,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status == reqwest::StatusCode::UNAUTHORIZED => {
                Self::NotAuthorized(err.to_string())
            }
            Some(status) => Self::Server {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None if err.is_builder() => Self::Config(err.to_string()),
            None => Self::Transient(err.to_string()),
        }
    }
}
