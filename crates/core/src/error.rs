//! Unified error types for bastion.
//!
//! Every failure of the access & caching layer is one of these variants.
//! Only [`Error::Blocked`] is ever counted against a target's circuit breaker.

use serde::{Deserialize, Serialize};
use tokio_rusqlite::rusqlite;

/// Retry hint handed out for infrastructure faults, in seconds.
const INFRA_RETRY_HINT_SECS: u64 = 30;

/// Unified error types for the access & caching layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters (e.g., a zero TTL).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Egress tunnel, IP probe or session-control endpoint unreachable or unsafe.
    #[error("INFRA_FAULT: {0}")]
    InfraFault(String),

    /// An anti-automation signature was observed and the rotation-retry did not clear it.
    #[error("BLOCKED: {target}: {reason}")]
    Blocked { target: String, reason: String },

    /// A fetch attempt or a control call exceeded its hard timeout.
    #[error("TIMEOUT: {0}")]
    Timeout(String),

    /// The target's circuit breaker is open.
    #[error("BREAKER_OPEN: {target} (retry after {retry_after_secs}s)")]
    BreakerOpen { target: String, retry_after_secs: u64 },

    /// Any other failure surfaced by a fetch function.
    #[error("UPSTREAM_FETCH: {0}")]
    UpstreamFetch(String),

    /// Payload could not be encoded or decoded.
    #[error("SERIALIZATION: {0}")]
    Serialization(String),

    /// Database operation failed.
    #[error("CACHE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("CACHE_ERROR: migration failed: {0}")]
    MigrationFailed(String),
}

/// User-visible rendering of an [`Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP-style status: 503 for unavailability, 500 otherwise.
    pub status: u16,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl Error {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "INVALID_INPUT",
            Error::InfraFault(_) => "INFRA_FAULT",
            Error::Blocked { .. } => "BLOCKED",
            Error::Timeout(_) => "TIMEOUT",
            Error::BreakerOpen { .. } => "BREAKER_OPEN",
            Error::UpstreamFetch(_) => "UPSTREAM_FETCH",
            Error::Serialization(_) => "SERIALIZATION",
            Error::Database(_) | Error::MigrationFailed(_) => "CACHE_ERROR",
        }
    }

    /// Whether this failure should advance a breaker toward `open`.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self, Error::Blocked { .. })
    }

    /// Seconds a caller should wait before retrying, when known.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Error::BreakerOpen { retry_after_secs, .. } => Some(*retry_after_secs),
            Error::InfraFault(_) => Some(INFRA_RETRY_HINT_SECS),
            _ => None,
        }
    }

    /// Map to the response surfaced to end users.
    ///
    /// Breaker and infrastructure failures become "service unavailable" with a
    /// retry hint; everything else is a generic failure carrying the message.
    pub fn to_response(&self) -> ErrorResponse {
        let status = match self {
            Error::BreakerOpen { .. } | Error::InfraFault(_) => 503,
            _ => 500,
        };
        ErrorResponse {
            status,
            code: self.code().to_string(),
            message: self.to_string(),
            retry_after_secs: self.retry_after_secs(),
        }
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
