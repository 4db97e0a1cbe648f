//! Cloud capability error types

use thiserror::Error;

/// Errors raised by provider, classic, object-store and converter capabilities
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Provider rejected the request: {0}")]
    Execute(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    /// Whether a caller may retry the same call later
    pub fn is_retryable(&self) -> bool {
        matches!(self, CloudError::Connect(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, CloudError::Auth(_))
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
