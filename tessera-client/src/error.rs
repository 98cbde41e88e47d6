//! Client error types.

use std::net::SocketAddr;
use std::path::PathBuf;
use tessera_protocol::{Outcome, ProtocolError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("request timeout")]
    Timeout,

    #[error("replica {endpoint} unavailable")]
    Unavailable { endpoint: SocketAddr },

    #[error("remote outcome: {0}")]
    Outcome(Outcome),

    #[error("no replicas configured")]
    NoReplicas,
}

impl ClientError {
    /// Returns whether this error is retryable.
    ///
    /// Timeouts are final: the caller's deadline has already passed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Unavailable { .. } => true,
            ClientError::Protocol(e) => e.is_malformed(),
            ClientError::Outcome(outcome) => outcome.is_retryable(),
            ClientError::Timeout | ClientError::NoReplicas => false,
        }
    }

    /// Returns whether a response failed to parse or verify.
    pub fn is_malformed(&self) -> bool {
        matches!(self, ClientError::Protocol(e) if e.is_malformed())
    }

    /// Returns the remote outcome, if the replica answered with one.
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            ClientError::Outcome(outcome) => Some(*outcome),
            _ => None,
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{}': {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("configuration validation failed: {0}")]
    Validation(String),
}
