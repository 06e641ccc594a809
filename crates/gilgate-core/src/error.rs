//! Error types for scheduling, execution and suspension.

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid environment variable '{key}': {message}")]
    InvalidEnvVar { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Errors surfaced by the producer side of the scheduler
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The request context ended before a response could be delivered.
    #[error("Job {job_id} was cancelled by its producer")]
    Cancelled { job_id: uuid::Uuid },

    /// The completion channel closed without a terminal result.
    #[error("Job {job_id} was abandoned without a result")]
    Abandoned { job_id: uuid::Uuid },

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

/// Errors raised by an execution engine implementation
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to bind execution slot for worker {worker}: {message}")]
    BindFailed { worker: usize, message: String },

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Engine error: {0}")]
    Other(String),
}

/// Request body errors
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    /// Bytes beyond the initial buffer were consumed, so the body cannot be replayed.
    #[error("Request body is not fully buffered and cannot be rewound")]
    NotRewindable,
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;
