//! Crate-level error type
//!
//! Each layer keeps its own error enum; [`ServiceError`] wraps them for the
//! service lifecycle and the binary, where only connection exhaustion and
//! configuration problems become process-level failures.

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::supervisor::SupervisorError;
use crate::transport::TransportError;
use thiserror::Error;

/// Main error type for service operations
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("HTTP server error: {message}")]
    Http { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    /// Create HTTP server error
    pub fn http_error<S: Into<String>>(message: S) -> Self {
        Self::Http {
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Short stable label for logs and metrics
    pub fn as_label(&self) -> &'static str {
        match self {
            ServiceError::Config(_) => "config",
            ServiceError::Broker(BrokerError::ConnectionFailed(_)) => "connection_failed",
            ServiceError::Broker(_) => "broker",
            ServiceError::Supervisor(SupervisorError::DrainTimeout { .. }) => "drain_timeout",
            ServiceError::Supervisor(_) => "supervisor",
            ServiceError::Transport(_) => "transport",
            ServiceError::Http { .. } => "http",
            ServiceError::Io(_) => "io",
            ServiceError::Internal { .. } => "internal",
        }
    }
}
