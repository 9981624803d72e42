use thiserror::Error;

use crate::models::ErrorKind;

/// Application-wide error types for Carve.
#[derive(Error, Debug)]
pub enum AppError {
    /// The target answered with a non-success HTTP status.
    #[error("HTTP {status} for {url}")]
    HttpError { status: u16, url: String },

    /// Page acquisition failed for a reason other than status or transport.
    #[error("Fetch error: {0}")]
    FetchError(String),

    /// The URL may not be fetched (scheme, private address).
    #[error("URL blocked: {0}")]
    UrlBlocked(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// The browser did not finish rendering in time.
    #[error("Render timed out after {0} seconds")]
    RenderTimeout(u64),

    /// A navigation step could not be performed.
    #[error("Navigation step {step} ({action}) failed: {message}")]
    NavigationError {
        step: usize,
        action: String,
        message: String,
    },

    /// The headless browser misbehaved (launch, tab, CDP).
    #[error("Browser error: {0}")]
    BrowserError(String),

    /// A selector, regex or transformation in a schema does not compile.
    #[error("Selector error: {0}")]
    SelectorError(String),

    /// Schema is structurally invalid, unknown or inactive.
    #[error("Schema error: {0}")]
    SchemaError(String),

    /// Request payload failed validation.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The state machine rejected a transition.
    #[error("Cannot {action} task in status '{from}'")]
    InvalidTransition { from: String, action: String },

    /// Concurrent modification (lost lease, duplicate id).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Work was abandoned at a cancellation point.
    #[error("Cancelled")]
    Cancelled,

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Missing or malformed configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RenderTimeout(_)
            | AppError::FetchError(_)
            | AppError::BrowserError(_)
            | AppError::NavigationError { .. }
            | AppError::DatabaseError(_) => true,
            AppError::HttpError { status, .. } => {
                matches!(status, 408 | 429) || (500..600).contains(status)
            }
            _ => false,
        }
    }

    /// Classifies the error into the kind recorded on a task.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            AppError::HttpError { .. }
            | AppError::FetchError(_)
            | AppError::UrlBlocked(_)
            | AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::BrowserError(_) => ErrorKind::FetchFailed,
            AppError::RenderTimeout(_) => ErrorKind::RenderTimeout,
            AppError::NavigationError { .. } => ErrorKind::NavigationFailed,
            AppError::SelectorError(_) | AppError::SchemaError(_) | AppError::ValidationError(_) => {
                ErrorKind::SchemaInvalid
            }
            _ => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(AppError::RenderTimeout(30).is_retryable());
        assert!(
            AppError::HttpError {
                status: 503,
                url: "https://example.com".into()
            }
            .is_retryable()
        );
        assert!(
            AppError::HttpError {
                status: 429,
                url: "https://example.com".into()
            }
            .is_retryable()
        );
        assert!(
            !AppError::HttpError {
                status: 404,
                url: "https://example.com".into()
            }
            .is_retryable()
        );
        assert!(!AppError::SchemaError("bad".into()).is_retryable());
        assert!(!AppError::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            AppError::NetworkError("x".into()).error_kind(),
            ErrorKind::FetchFailed
        );
        assert_eq!(
            AppError::RenderTimeout(5).error_kind(),
            ErrorKind::RenderTimeout
        );
        assert_eq!(
            AppError::NavigationError {
                step: 0,
                action: "click".into(),
                message: "no element".into()
            }
            .error_kind(),
            ErrorKind::NavigationFailed
        );
        assert_eq!(
            AppError::SelectorError("h1[".into()).error_kind(),
            ErrorKind::SchemaInvalid
        );
    }
}
