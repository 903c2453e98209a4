//! Error types for the pooler
//!
//! This module provides the error type shared by backend connections, the
//! router and the auth query.

use crate::protocol::message::ErrorOrNoticeFields;
use pgpooler_core::CoreError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for the pooler
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Error type for the pooler
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration source could not be loaded
    #[error("Configuration error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// Core error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Internal client could not be created
    #[error("Allocation error: {0}")]
    Allocation(String),

    /// No route matches the client
    #[error("Routing error: {0}")]
    Routing(String),

    /// No server connection could be attached
    #[error("Attachment error: {0}")]
    Attachment(String),

    /// Backend transport failure (connect, write or read)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Backend did not answer in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// PostgreSQL protocol violation
    #[error("PostgreSQL protocol error: {0}")]
    Protocol(String),

    /// Backend sent an ErrorResponse
    #[error("Server error {code}: {message}")]
    ServerReported {
        /// SQLSTATE code
        code: String,
        /// Primary message
        message: String,
    },

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl ProxyError {
    /// Whether the error is a timeout.
    ///
    /// Timeouts fail an operation like any other transport error but are not
    /// reported at error level.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProxyError::Timeout(_))
    }

    /// Build a `ServerReported` error from decoded ErrorResponse fields
    pub fn server_reported(fields: &ErrorOrNoticeFields) -> Self {
        ProxyError::ServerReported {
            code: fields.code.clone().unwrap_or_else(|| "XX000".to_string()),
            message: fields
                .message
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        }
    }
}

/// Helper function to convert I/O level failures to transport errors
pub fn to_transport_error<E: ToString>(err: E) -> ProxyError {
    ProxyError::Transport(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_reported_from_fields() {
        let fields = ErrorOrNoticeFields {
            code: Some("42P01".to_string()),
            message: Some("relation \"pg_shadow2\" does not exist".to_string()),
            ..Default::default()
        };

        let err = ProxyError::server_reported(&fields);
        assert_eq!(
            err.to_string(),
            "Server error 42P01: relation \"pg_shadow2\" does not exist"
        );
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_timeout_is_distinguished() {
        assert!(ProxyError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(!ProxyError::Transport("reset".to_string()).is_timeout());
    }
}
