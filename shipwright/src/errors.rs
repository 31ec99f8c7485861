//! Error types for shipwright

use thiserror::Error;

/// Main error type for a deployment run
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Unsupported SCM type: {0:?}")]
    UnsupportedScmVariant(String),

    #[error("Release allocation failed: {0}")]
    ReleaseAllocationFailed(String),

    #[error("Checkout failed: {0}")]
    CheckoutFailed(String),

    #[error("Build step failed: {0}")]
    BuildStepFailed(String),

    #[error("Restart failed: {0}")]
    RestartFailed(String),

    #[error("No previous release to roll back to")]
    NoPreviousRelease,

    #[error("Stage {stage} failed: {message}")]
    HookFailed { stage: String, message: String },

    #[error("Another deployment holds the lock at {0}")]
    Locked(String),

    #[error("Invalid deployment spec: {0}")]
    InvalidSpec(String),

    #[error("Invalid release transition: {0}")]
    InvalidTransition(String),

    #[error("Ownership error: {0}")]
    Ownership(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Whether the error aborts the run with the previous release left active.
    ///
    /// Only `RestartFailed` happens after the pointer switch; everything else
    /// is raised before it.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DeployError::RestartFailed(_))
    }
}

impl From<tokio::task::JoinError> for DeployError {
    fn from(err: tokio::task::JoinError) -> Self {
        DeployError::Internal(err.to_string())
    }
}
