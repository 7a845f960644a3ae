//! Application error model with MCP error mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error handling,
//! and maps each variant to the appropriate MCP `ErrorData` type for protocol
//! compliance. Each variant also carries a stable `code` that is written into
//! job error events so observers can tell a saturated mail server apart from a
//! logic bug without parsing messages.

use rmcp::model::ErrorData;
use serde_json::json;
use thiserror::Error;

/// Application error type
///
/// Covers every failure the sync engine may surface: input validation,
/// IMAP transport problems, pool exhaustion, job state machine violations and
/// storage failures.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input (validation failed, malformed request)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Resource not found (job, folder, message)
    #[error("not found: {0}")]
    NotFound(String),
    /// Authentication failure (bad credentials, account disabled)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Operation timeout (TCP connect, TLS handshake, IMAP response)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Conflict (mailbox UIDVALIDITY changed, state inconsistent)
    #[error("conflict: {0}")]
    Conflict(String),
    /// IMAP session failed mid-operation; the connection must be discarded
    #[error("protocol failure: {0}")]
    Protocol(String),
    /// No pooled connection became available within the acquire timeout
    #[error("connection pool exhausted: {0}")]
    ResourceExhausted(String),
    /// A job write was attempted against a job in the wrong state
    #[error("invalid job transition for {job_id}: {detail}")]
    InvalidTransition { job_id: String, detail: String },
    /// SQLite or migration failure
    #[error("storage error: {0}")]
    Storage(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Convenience constructor for `InvalidTransition`
    pub fn transition(job_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidTransition {
            job_id: job_id.into(),
            detail: detail.into(),
        }
    }

    /// Whether the error means the IMAP session is no longer usable
    ///
    /// Connection-level failures are retried once on a fresh session and
    /// cause the session to be discarded instead of returned to the pool.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Timeout(_))
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::AuthFailed(_) => "auth_failed",
            Self::Timeout(_) => "timeout",
            Self::Conflict(_) => "conflict",
            Self::Protocol(_) => "protocol",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Storage(_) => "storage",
            Self::Internal(_) => "internal",
        }
    }

    /// Convert to MCP `ErrorData`
    ///
    /// Maps each `AppError` variant to the appropriate MCP error type and
    /// includes a structured `code` field for client error handling.
    ///
    /// # Mappings
    ///
    /// - `InvalidInput` → `invalid_params`
    /// - `NotFound` → `resource_not_found`
    /// - `AuthFailed`, `Conflict`, `InvalidTransition` → `invalid_request`
    /// - everything else → `internal_error`
    pub fn to_error_data(&self) -> ErrorData {
        let data = Some(json!({ "code": self.code() }));
        let msg = self.to_string();
        match self {
            Self::InvalidInput(_) => ErrorData::invalid_params(msg, data),
            Self::NotFound(_) => ErrorData::resource_not_found(msg, data),
            Self::AuthFailed(_) | Self::Conflict(_) | Self::InvalidTransition { .. } => {
                ErrorData::invalid_request(msg, data)
            }
            Self::Timeout(_)
            | Self::Protocol(_)
            | Self::ResourceExhausted(_)
            | Self::Storage(_)
            | Self::Internal(_) => ErrorData::internal_error(msg, data),
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for AppError {
    fn from(e: rusqlite_migration::Error) -> Self {
        Self::Storage(format!("migration failed: {e}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failure: {e}"))
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;
