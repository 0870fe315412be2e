//! Error types for Cadence

use thiserror::Error;

/// Core Cadence errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CadenceError {
    // Time errors
    #[error("Clock not synced with the chain yet")]
    NotSynced,

    // Remote read errors
    #[error("Network error: {0}")]
    Network(String),

    // Precondition errors
    #[error("No signer")]
    NoSigner,

    #[error("No active entity")]
    NoEntity,

    #[error("Submission in progress")]
    SubmissionInProgress,

    // Local storage errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Transaction errors
    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CadenceError {
    /// Errors that should be retried on a backoff instead of surfaced
    pub fn is_retryable(&self) -> bool {
        matches!(self, CadenceError::NotSynced | CadenceError::Network(_))
    }

    /// Caller bugs: acting without the state the operation needs
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            CadenceError::NoSigner | CadenceError::NoEntity | CadenceError::SubmissionInProgress
        )
    }
}

/// Result type for Cadence operations
pub type CadenceResult<T> = Result<T, CadenceError>;
