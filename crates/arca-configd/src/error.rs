//! Closed error taxonomy for the configuration datastore.
//!
//! Every fallible operation in this crate returns [`Error`], whose variants
//! map onto the fixed set of error codes callers are allowed to branch on:
//! `NOT_FOUND`, `CONFLICT`, `VALIDATION`, `TIMEOUT`, `INTERNAL`,
//! `UNAUTHORIZED`.

use std::fmt;

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the datastore, lock manager, and session core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation conflicts with concurrent state (lost lock, CAS
    /// failure, stale optimistic read, double acquisition by another
    /// session).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Caller-supplied input failed validation before any I/O occurred.
    #[error("validation error: {0}")]
    Validation(String),

    /// The operation's cancellation/deadline token fired before completion.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The caller is not permitted to perform this operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Any backend failure that does not fit the taxonomy above. The
    /// original cause is chained via `#[source]`.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable description.
        message: String,
        /// Underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// The stable error code exposed to callers (§6 of the contract).
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Validation(_) => "VALIDATION",
            Self::Timeout(_) => "TIMEOUT",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// Build an [`Error::Internal`] from an arbitrary cause.
    pub fn internal<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Build an [`Error::Internal`] with no chained cause.
    pub fn internal_msg(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// True if this error should be surfaced to the session layer as
    /// "re-acquire the lock and try again".
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::internal("sqlite backend error", other),
        }
    }
}

impl From<etcd_client::Error> for Error {
    fn from(err: etcd_client::Error) -> Self {
        Self::internal("etcd backend error", err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::internal("json codec error", err)
    }
}

/// Wrapper so `tokio::time::timeout` elapsed errors carry a description.
#[derive(Debug)]
pub struct DeadlineExceeded(pub String);

impl fmt::Display for DeadlineExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deadline exceeded: {}", self.0)
    }
}

impl std::error::Error for DeadlineExceeded {}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        Self::Timeout("operation exceeded its deadline".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_matches_taxonomy() {
        assert_eq!(Error::NotFound("x".into()).code(), "NOT_FOUND");
        assert_eq!(Error::Conflict("x".into()).code(), "CONFLICT");
        assert_eq!(Error::Validation("x".into()).code(), "VALIDATION");
        assert_eq!(Error::Timeout("x".into()).code(), "TIMEOUT");
        assert_eq!(Error::Unauthorized("x".into()).code(), "UNAUTHORIZED");
        assert_eq!(Error::internal_msg("x").code(), "INTERNAL");
    }

    #[test]
    fn is_conflict_only_for_conflict_variant() {
        assert!(Error::Conflict("x".into()).is_conflict());
        assert!(!Error::NotFound("x".into()).is_conflict());
    }
}
