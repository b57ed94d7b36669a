// Central Error Types for the Queue Subsystem

use thiserror::Error;

use crate::port::ManagerError;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors surfaced by queue operations (memory and durable)
#[derive(Error, Debug)]
pub enum QueueError {
    /// The queue's lifetime has ended and nothing is left to drain
    #[error("queue is closed")]
    Closed,

    /// A transient failure raced with shutdown
    #[error("queue was stopped")]
    Stopped,

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("broker error: {0}")]
    Manager(#[from] ManagerError),

    #[error("broker still unreachable after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: ManagerError,
    },
}

impl QueueError {
    pub fn is_closed(&self) -> bool {
        matches!(self, QueueError::Closed)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, QueueError::Stopped)
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

impl From<ManagerError> for AppError {
    fn from(err: ManagerError) -> Self {
        AppError::Queue(QueueError::Manager(err))
    }
}
