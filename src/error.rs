//! Error types for calcd.

use thiserror::Error;

use crate::model::JobStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("no alive worker for owner '{owner}'")]
    NoWorkerAvailable { owner: String },

    #[error("worker at {endpoint} unreachable: {reason}")]
    WorkerUnreachable { endpoint: String, reason: String },

    #[error("job {0} is already being processed")]
    JobInProgress(i64),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable machine-readable tag, used on the wire so callers and the
    /// dispatcher can tell failure kinds apart.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidExpression(_) => "invalid_expression",
            Error::DivisionByZero => "division_by_zero",
            Error::NoWorkerAvailable { .. } => "no_worker_available",
            Error::WorkerUnreachable { .. } => "worker_unreachable",
            Error::JobInProgress(_) => "job_in_progress",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::NotFound(_) => "not_found",
            Error::Storage(_) => "storage",
            Error::Config(_) => "config",
            Error::Other(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
