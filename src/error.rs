use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Whether a KV-tier failure should count toward provider fail-over.
    pub fn is_retryable_kv(&self) -> bool {
        matches!(
            self,
            RelayError::RateLimited(_)
                | RelayError::QuotaExhausted(_)
                | RelayError::Network(_)
                | RelayError::Timeout(_)
        )
    }
}

impl Clone for RelayError {
    fn clone(&self) -> Self {
        match self {
            RelayError::Io(e) => RelayError::Internal(e.to_string()),
            RelayError::NotFound(s) => RelayError::NotFound(s.clone()),
            RelayError::Conflict(s) => RelayError::Conflict(s.clone()),
            RelayError::Duplicate(s) => RelayError::Duplicate(s.clone()),
            RelayError::RateLimited(s) => RelayError::RateLimited(s.clone()),
            RelayError::QuotaExhausted(s) => RelayError::QuotaExhausted(s.clone()),
            RelayError::Network(s) => RelayError::Network(s.clone()),
            RelayError::Timeout(s) => RelayError::Timeout(s.clone()),
            RelayError::Auth(s) => RelayError::Auth(s.clone()),
            RelayError::Serialization(s) => RelayError::Serialization(s.clone()),
            RelayError::Configuration(s) => RelayError::Configuration(s.clone()),
            RelayError::Cancelled(s) => RelayError::Cancelled(s.clone()),
            RelayError::CircuitOpen(s) => RelayError::CircuitOpen(s.clone()),
            RelayError::LockError(s) => RelayError::LockError(s.clone()),
            RelayError::Upload(s) => RelayError::Upload(s.clone()),
            RelayError::Unavailable(s) => RelayError::Unavailable(s.clone()),
            RelayError::InvalidState(s) => RelayError::InvalidState(s.clone()),
            RelayError::Internal(s) => RelayError::Internal(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

// Error conversions for common error types

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RelayError::Timeout(e.to_string())
        } else {
            RelayError::Network(e.to_string())
        }
    }
}
