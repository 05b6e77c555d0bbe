//! Error taxonomy for the client.

use thiserror::Error;

use crate::transport::TransportError;

/// Every failure the client can surface to a caller.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid client setup, e.g. a write with no database configured.
    #[error("configuration error: {0}")]
    Config(String),

    /// Rejected before any network call (schema violations, bad timestamps).
    #[error("validation error: {0}")]
    Validation(String),

    /// Connection refused / reset / timed out.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server answered with a 5xx status.
    #[error("service unavailable ({status}): {message}")]
    ServiceUnavailable { status: u16, message: String },

    /// The server answered with a 3xx or 4xx status.
    #[error("request failed ({status}): {body}")]
    Request { status: u16, body: String },

    /// The response envelope named a query-level error.
    #[error("query error: {0}")]
    Query(String),

    /// Every configured host is currently quarantined.
    #[error("no host available")]
    NoHostAvailable,

    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the pool treats this failure as a reason to quarantine the
    /// host and try another one.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(e) => e.is_retryable(),
            Error::ServiceUnavailable { .. } => true,
            _ => false,
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::ServiceUnavailable { status, .. } | Error::Request { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
