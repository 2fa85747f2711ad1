//! Error types for stagehand

use thiserror::Error;

/// Main error type for stagehand
#[derive(Error, Debug)]
pub enum StagehandError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Base64 error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Document update conflict: {0}")]
    Conflict(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Store responded {status}: {reason}")]
    Status { status: u16, reason: String },

    #[error("Invalid deployment request: {0}")]
    InvalidRequest(String),

    #[error("Deployment error: {0}")]
    Deploy(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StagehandError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StagehandError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StagehandError::Conflict(_))
    }

    /// Timeouts are transient: a long-running view query or a large bulk write
    /// may have been cut off while the store keeps working on it.
    pub fn is_timeout(&self) -> bool {
        match self {
            StagehandError::Timeout(_) => true,
            StagehandError::HttpError(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// Any 4xx-class response from a store.
    pub fn is_client_error(&self) -> bool {
        match self {
            StagehandError::NotFound(_) | StagehandError::Conflict(_) => true,
            StagehandError::Status { status, .. } => (400..500).contains(status),
            _ => false,
        }
    }
}

impl From<anyhow::Error> for StagehandError {
    fn from(err: anyhow::Error) -> Self {
        StagehandError::Internal(err.to_string())
    }
}
