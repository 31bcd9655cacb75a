// Central Error Type for the Application

use crate::port::{ArtifactError, InferenceError, QueueError, SendError};
use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Work was interrupted because shutdown was requested
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// True for a queue store that refuses this process
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, AppError::Queue(QueueError::PermissionDenied(_)))
    }

    /// True when the remote service refused our credentials
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, AppError::Inference(e) if e.is_unauthorized())
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
