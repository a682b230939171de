//! Error types for runbook operations

use thiserror::Error;

/// Errors that can occur during runbook operations
#[derive(Debug, Error)]
pub enum RunbookError {
    /// Unknown execution, step or approval request
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation attempted from an incompatible status
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Retry requested beyond the step's retry budget
    #[error("Retry limit reached for step {step_id} ({max_retries} retries)")]
    RetryExhausted {
        /// Step whose retries are exhausted
        step_id: String,
        /// Configured retry budget
        max_retries: u32,
    },

    /// Approval was denied by an approver
    #[error("Approval denied: {0}")]
    ApprovalDenied(String),

    /// Approval request expired before a decision was made
    #[error("Approval expired for step {0}")]
    ApprovalExpired(String),

    /// Step or compensation collaborator failed
    #[error("Collaborator failure: {0}")]
    CollaboratorFailure(String),

    /// Compensation replay failed
    #[error("Rollback failed: {0}")]
    RollbackFailure(String),

    /// Persistence collaborator failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Invalid runbook definition
    #[error("Invalid runbook: {0}")]
    Invalid(String),

    /// Work was cancelled through its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for RunbookError {
    fn from(err: config::ConfigError) -> Self {
        RunbookError::Config(err.to_string())
    }
}

/// Result type for runbook operations
pub type RunbookResult<T> = Result<T, RunbookError>;
