//! Grid-specific error types

use thiserror::Error;

/// Errors that can occur in grid trading operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GridError {
    /// Invalid or insufficient configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The exchange declined the request
    #[error("Order rejected (code {code}): {message}")]
    OrderRejected { code: i64, message: String },

    #[error("Network failure: {0}")]
    Network(String),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("Risk limit exceeded: {0}")]
    RiskLimitExceeded(String),

    #[error("Position not found: order id {0}")]
    PositionNotFound(String),

    #[error("State persistence error: {0}")]
    StatePersistence(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),
}

impl GridError {
    /// Shorthand for a rejection without an exchange code
    pub fn rejected(message: impl Into<String>) -> Self {
        GridError::OrderRejected {
            code: -1,
            message: message.into(),
        }
    }

    /// Whether the failure came from talking to the exchange. Rejections,
    /// network failures and timeouts are all handled the same way: the
    /// controller leaves its state untouched.
    pub fn is_exchange_failure(&self) -> bool {
        matches!(
            self,
            GridError::OrderRejected { .. } | GridError::Network(_) | GridError::Timeout(_)
        )
    }

    /// Whether retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, GridError::Network(_) | GridError::Timeout(_))
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for GridError {
    fn from(err: std::io::Error) -> Self {
        GridError::StatePersistence(err.to_string())
    }
}

impl From<reqwest::Error> for GridError {
    fn from(err: reqwest::Error) -> Self {
        GridError::Network(err.to_string())
    }
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;
