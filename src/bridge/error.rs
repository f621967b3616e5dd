//! Bridge error types.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::config::SettingsError;
use crate::protocol::ErrorCode;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that can occur talking to the worker.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The worker could not be located or spawned.
    #[error("failed to start worker: {0}")]
    Startup(String),

    /// The worker did not confirm startup.
    #[error("worker handshake failed: {0}")]
    Handshake(String),

    /// The worker could not open a database connection.
    #[error("database connection failed: {0}")]
    Connect(String),

    /// The worker had no connection to spare in time.
    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),

    /// No response within the caller's timeout.
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The statement failed. Carries the worker's error text verbatim.
    #[error("{0}")]
    Query(String),

    /// The bridge was torn down while the request was outstanding.
    #[error("worker disconnected")]
    Disconnected,

    /// The worker broke the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failed to write to worker stdin.
    #[error("failed to write to worker: {0}")]
    WriteFailed(#[source] io::Error),

    /// Invalid or unreadable configuration.
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// A query expected to return a row returned none.
    #[error("no result was found")]
    NoRows,
}

impl BridgeError {
    /// Build the error for a failed response from its code and text.
    pub fn from_worker(code: Option<ErrorCode>, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            Some(ErrorCode::PoolExhausted) => Self::PoolExhausted(message),
            Some(ErrorCode::ConnectionFailed) => Self::Connect(message),
            _ => Self::Query(message),
        }
    }

    /// Check if this error means the worker is gone.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected | Self::WriteFailed(_))
    }

    /// Check if this error is retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::PoolExhausted(_) | Self::Disconnected
        )
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for BridgeError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::Disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            BridgeError::from_worker(Some(ErrorCode::PoolExhausted), "busy"),
            BridgeError::PoolExhausted(_)
        ));
        assert!(matches!(
            BridgeError::from_worker(Some(ErrorCode::ConnectionFailed), "refused"),
            BridgeError::Connect(_)
        ));
        assert!(matches!(
            BridgeError::from_worker(Some(ErrorCode::Timeout), "slow"),
            BridgeError::Query(_)
        ));
        assert!(matches!(
            BridgeError::from_worker(None, "Invalid column name 'x'."),
            BridgeError::Query(_)
        ));
    }

    #[test]
    fn test_query_text_is_verbatim() {
        let err = BridgeError::from_worker(Some(ErrorCode::QueryFailed), "Invalid column name 'x'.");
        assert_eq!(err.to_string(), "Invalid column name 'x'.");
    }

    #[test]
    fn test_retriable() {
        assert!(BridgeError::Timeout(Duration::from_secs(1)).is_retriable());
        assert!(BridgeError::Disconnected.is_retriable());
        assert!(BridgeError::Disconnected.is_disconnected());
        assert!(!BridgeError::Query("x".to_string()).is_retriable());
        assert!(!BridgeError::NoRows.is_disconnected());
    }
}
