//! Error types for the session core.
//!
//! Messages are intentionally generic so they can be shown to end users.
//! Detailed causes are logged at debug level by the component that failed.

use std::fmt;
use thiserror::Error;

/// Errors that can occur across session resolution, verification and refresh.
///
/// `Clone` so that failures can be published through watch channels.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The API credential could not be resolved into a base URL and environment.
    #[error("Credential resolution failed: {0}")]
    CredentialResolution(String),

    /// The remote key set was unreachable or malformed.
    #[error("Key set fetch failed: {0}")]
    KeyFetch(String),

    /// The presented token failed verification.
    #[error(transparent)]
    InvalidToken(#[from] InvalidTokenError),

    /// The session refresh call failed (retryable).
    #[error("Session refresh failed: {0}")]
    RefreshTransport(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The verification context has not been resolved yet.
    #[error("Session controller is not ready")]
    NotReady,

    /// The owning component was torn down.
    #[error("Session controller is closed")]
    Closed,
}

impl SessionError {
    /// Whether this error means the token itself is unusable.
    #[must_use]
    pub fn is_invalid_token(&self) -> bool {
        matches!(self, SessionError::InvalidToken(_))
    }
}

/// A single key's verification failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFailure {
    /// Key ID of the candidate key, if it had one.
    pub kid: Option<String>,

    /// Why verification against this key failed.
    pub reason: String,
}

impl fmt::Display for KeyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kid {
            Some(kid) => write!(f, "key {kid}: {}", self.reason),
            None => write!(f, "key <no kid>: {}", self.reason),
        }
    }
}

/// Token verification failure.
///
/// `reason` is the first failure encountered. When several candidate keys were
/// tried, `key_failures` holds every per-key failure in the order tried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("The session token is invalid or expired: {reason}")]
pub struct InvalidTokenError {
    /// First failure reason.
    pub reason: String,

    /// Every per-key failure, in the order the keys were tried.
    pub key_failures: Vec<KeyFailure>,
}

impl InvalidTokenError {
    /// A failure that happened before any key was tried.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            key_failures: Vec::new(),
        }
    }

    /// Build from per-key failures, keeping the first as the reported reason.
    ///
    /// Returns `None` when `failures` is empty.
    #[must_use]
    pub fn from_key_failures(failures: Vec<KeyFailure>) -> Option<Self> {
        let reason = failures.first()?.reason.clone();
        Some(Self {
            reason,
            key_failures: failures,
        })
    }
}

/// Result type alias using `SessionError`
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_first_key_failure_is_reported() {
        let err = InvalidTokenError::from_key_failures(vec![
            KeyFailure {
                kid: Some("old".to_string()),
                reason: "InvalidSignature".to_string(),
            },
            KeyFailure {
                kid: Some("new".to_string()),
                reason: "ExpiredSignature".to_string(),
            },
        ])
        .unwrap();

        assert_eq!(err.reason, "InvalidSignature");
        assert_eq!(err.key_failures.len(), 2);
        assert!(err.to_string().contains("InvalidSignature"));
    }

    #[test]
    fn test_no_key_failures_yields_none() {
        assert!(InvalidTokenError::from_key_failures(Vec::new()).is_none());
    }

    #[test]
    fn test_session_error_display() {
        let err = SessionError::KeyFetch("status 500".to_string());
        assert!(err.to_string().contains("status 500"));

        let err = SessionError::RefreshTransport("missing header".to_string());
        assert!(err.to_string().contains("missing header"));

        let err: SessionError = InvalidTokenError::new("malformed").into();
        assert!(err.is_invalid_token());
        assert!(err.to_string().contains("invalid or expired"));

        assert!(SessionError::Closed.to_string().contains("closed"));
    }

    #[test]
    fn test_key_failure_display() {
        let failure = KeyFailure {
            kid: None,
            reason: "unsupported key type".to_string(),
        };
        assert_eq!(failure.to_string(), "key <no kid>: unsupported key type");
    }
}
