//! Worker-side error types.

use std::time::Duration;
use thiserror::Error;

use crate::protocol::ErrorCode;

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors reported by a database driver.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// Could not open a connection.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The statement failed. Carries the driver's message verbatim.
    #[error("{0}")]
    Query(String),

    /// The connection was already closed.
    #[error("connection is closed")]
    Closed,
}

/// Errors from the connection pools.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    /// No connection became available in time.
    #[error("no connection available within {}ms", .0.as_millis())]
    Exhausted(Duration),

    /// Opening a new connection failed.
    #[error(transparent)]
    Connect(DriverError),

    /// The pool has been shut down.
    #[error("connection pool is shut down")]
    Closed,
}

impl DriverError {
    /// Wire error code for a response carrying this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Connect(_) | Self::Closed => ErrorCode::ConnectionFailed,
            Self::Query(_) => ErrorCode::QueryFailed,
        }
    }
}

impl PoolError {
    /// Wire error code for a response carrying this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Exhausted(_) => ErrorCode::PoolExhausted,
            Self::Connect(_) | Self::Closed => ErrorCode::ConnectionFailed,
        }
    }
}

impl From<DriverError> for PoolError {
    fn from(err: DriverError) -> Self {
        Self::Connect(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_text_is_verbatim() {
        let err = DriverError::Query("Invalid object name 'nope'.".to_string());
        assert_eq!(err.to_string(), "Invalid object name 'nope'.");
        assert_eq!(err.error_code(), ErrorCode::QueryFailed);
    }

    #[test]
    fn test_pool_error_codes() {
        assert_eq!(
            PoolError::Exhausted(Duration::from_millis(50)).error_code(),
            ErrorCode::PoolExhausted
        );
        assert_eq!(
            PoolError::from(DriverError::Connect("refused".to_string())).error_code(),
            ErrorCode::ConnectionFailed
        );
        assert_eq!(
            PoolError::Exhausted(Duration::from_millis(50)).to_string(),
            "no connection available within 50ms"
        );
    }
}
