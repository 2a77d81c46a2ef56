//! Storage error taxonomy.
//!
//! Absence of a record is never an error at this layer: lookups return
//! `Ok(None)`. Errors distinguish a backend that cannot be reached from a
//! record that was required but missing, so callers can decide between
//! retrying locally and surfacing the failure.

use thiserror::Error;

/// Result type alias using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by [`crate::Store`] implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Backend I/O failed, timed out, or the connection is gone.
    #[error("{backend} store unavailable: {message}")]
    Unavailable {
        /// Backend that produced the failure
        backend: &'static str,
        /// Underlying error description
        message: String,
    },

    /// An operation required a record that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A stored value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Schema migration failed.
    #[error("migration failed: {0}")]
    Migration(String),

    /// Caller supplied a value that violates a store invariant.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StoreError {
    /// Creates an unavailable error for the given backend.
    pub fn unavailable(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable { backend, message: message.into() }
    }

    /// Returns true when the backend could not service the request.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Returns true when a required record was missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested row not found".to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::Serialization(err.to_string())
            },
            _ => Self::unavailable("postgres", err.to_string()),
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::unavailable("redis", err.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => {
                Self::NotFound("requested row not found".to_string())
            },
            _ => Self::unavailable("embedded", err.to_string()),
        }
    }
}
