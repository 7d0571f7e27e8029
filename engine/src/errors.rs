//! Error types for the dockhand engine

use thiserror::Error;

/// Main error type for the deployment engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Git provider unreachable, bad credentials or a ref that does not
    /// exist. Never retried: retrying a bad ref cannot succeed.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// A domain binding references a service missing from the compose
    /// document.
    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Invalid compose document: {0}")]
    TransformInvalid(String),

    /// The Docker engine rejected the operation. Full stderr is preserved
    /// for the deployment log.
    #[error("Execution failed: {stderr}")]
    ExecutionFailed { stderr: String },

    /// Remote host could not be reached after bounded retries.
    #[error("Target unreachable: {0}")]
    TargetUnreachable(String),

    /// Resource is flagged inactive by the billing/quota collaborator.
    #[error("Resource inactive: {0}")]
    ResourceInactive(String),

    /// A concurrency lease expired and was reclaimed; the holding job is
    /// forced to a terminal error.
    #[error("Lease timeout: {0}")]
    LeaseTimeout(String),

    /// Job cancelled at a phase boundary by an operator request.
    #[error("Job cancelled")]
    Cancelled,

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}
