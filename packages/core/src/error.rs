//! Error types shared by the dispatch engine.

use crate::{JobId, WorkerId};

/// Errors surfaced to callers of the dispatch engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Queue is full ({capacity} jobs)")]
    QueueFull { capacity: usize },

    #[error("Queue is shut down")]
    QueueClosed,

    #[error("Job already submitted: {0}")]
    DuplicateJob(JobId),

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Worker already registered: {0}")]
    DuplicateWorker(WorkerId),

    #[error("Actor error: {0}")]
    Actor(String),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}={value}: {reason}")]
    InvalidEnv {
        var: String,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
