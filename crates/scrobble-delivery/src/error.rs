//! Error types and failure classification for scrobble delivery.
//!
//! Upstream failures are sorted into two buckets by [`classify`]: retryable
//! failures are enrolled in the retry queue, fatal ones are logged and
//! dropped. Everything else surfaces to the caller with enough context to
//! log it and render a message.

use std::fmt;

use scrobble_core::StoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Statuses the upstream API returns for transient conditions.
pub const RETRYABLE_STATUSES: [u16; 4] = [429, 502, 503, 504];

/// Outcome of classifying a failed upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Transient failure; enroll in the retry queue.
    Retryable,
    /// Permanent rejection; log and drop.
    Fatal,
}

/// Classifies a failed upstream call by its HTTP status.
///
/// `None` means the call failed below HTTP (connect error, reset, timeout)
/// and is always retryable.
pub fn classify(status: Option<u16>) -> Classification {
    match status {
        None => Classification::Retryable,
        Some(status) if RETRYABLE_STATUSES.contains(&status) => Classification::Retryable,
        Some(_) => Classification::Fatal,
    }
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_ref().map(|c| format!(" ({c})")).unwrap_or_default()
}

/// Errors produced while delivering scrobbles or managing tokens.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    Network {
        /// Error message describing the network failure
        message: String,
    },

    /// Upstream request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// Upstream answered with a non-success status.
    #[error("upstream rejected request: HTTP {status_code}{}", code_suffix(.code))]
    Upstream {
        /// HTTP status code
        status_code: u16,
        /// Upstream error code, when the body carried one
        code: Option<String>,
        /// Upstream error description
        description: Option<String>,
        /// Retry-After hint in seconds
        retry_after_seconds: Option<u64>,
    },

    /// Token refresh failed; the user was removed and must re-authorize.
    #[error("user {user_id} is no longer authorized: {reason}")]
    Unauthorized {
        /// User whose credentials were revoked
        user_id: String,
        /// Why the refresh failed
        reason: String,
    },

    /// The event was addressed to a user that does not exist.
    #[error("unknown user {user_id}")]
    UnknownUser {
        /// Identifier from the event
        user_id: String,
    },

    /// A group member's credentials record is missing.
    #[error("credentials for group member {member} are missing")]
    MissingCredentials {
        /// Member username
        member: String,
    },

    /// Authorization state token was unknown, expired, or already used.
    #[error("invalid authorization state: {message}")]
    InvalidAuthState {
        /// Why the state was rejected
        message: String,
    },

    /// Store operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Invalid client or engine configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates an upstream error from a status code alone.
    pub fn upstream(status_code: u16) -> Self {
        Self::Upstream { status_code, code: None, description: None, retry_after_seconds: None }
    }

    /// Creates an upstream error carrying the body's error code and description.
    pub fn upstream_with_body(
        status_code: u16,
        code: Option<String>,
        description: Option<String>,
    ) -> Self {
        Self::Upstream { status_code, code, description, retry_after_seconds: None }
    }

    /// Creates an unauthorized error for a user whose refresh failed.
    pub fn unauthorized(user_id: impl ToString, reason: impl Into<String>) -> Self {
        Self::Unauthorized { user_id: user_id.to_string(), reason: reason.into() }
    }

    /// Creates an unknown-user error.
    pub fn unknown_user(user_id: impl ToString) -> Self {
        Self::UnknownUser { user_id: user_id.to_string() }
    }

    /// Creates an invalid authorization state error.
    pub fn invalid_auth_state(message: impl Into<String>) -> Self {
        Self::InvalidAuthState { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// HTTP status returned by the upstream, if the call got that far.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Upstream { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }

    /// Upstream error code, if the response body carried one.
    pub fn upstream_code(&self) -> Option<&str> {
        match self {
            Self::Upstream { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Classification of upstream call failures.
    ///
    /// Returns `None` for errors that never reached the upstream, such as
    /// storage failures or an unknown user.
    pub fn classification(&self) -> Option<Classification> {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => Some(classify(None)),
            Self::Upstream { status_code, .. } => Some(classify(Some(*status_code))),
            _ => None,
        }
    }

    /// Returns true when the failure should be enrolled in the retry queue.
    pub fn is_retryable(&self) -> bool {
        self.classification() == Some(Classification::Retryable)
    }

    /// Suggested delay before retrying, from the upstream Retry-After header.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::Upstream { retry_after_seconds, .. } => *retry_after_seconds,
            _ => None,
        }
    }

    /// Coarse category used in logs and failure reports.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

/// Category of delivery error for logs and operator-facing reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Refresh failed; the user must re-authorize.
    Unauthorized,
    /// Network failure or transient upstream status.
    RetryableTransient,
    /// Permanent upstream rejection.
    FatalRejected,
    /// A referenced user or credentials record is absent.
    NotFound,
    /// Backend I/O failure.
    StorageUnavailable,
    /// Configuration problems.
    Configuration,
    /// Internal system errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Network { .. }
            | DeliveryError::Timeout { .. }
            | DeliveryError::Upstream { .. } => match error.classification() {
                Some(Classification::Retryable) => Self::RetryableTransient,
                _ => Self::FatalRejected,
            },
            DeliveryError::Unauthorized { .. } | DeliveryError::InvalidAuthState { .. } => {
                Self::Unauthorized
            },
            DeliveryError::UnknownUser { .. } | DeliveryError::MissingCredentials { .. } => {
                Self::NotFound
            },
            DeliveryError::Storage(StoreError::NotFound(_)) => Self::NotFound,
            DeliveryError::Storage(_) => Self::StorageUnavailable,
            DeliveryError::Configuration { .. } => Self::Configuration,
            DeliveryError::Internal { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::RetryableTransient => write!(f, "retryable_transient"),
            Self::FatalRejected => write!(f, "fatal_rejected"),
            Self::NotFound => write!(f, "not_found"),
            Self::StorageUnavailable => write!(f, "storage_unavailable"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
