//! Session and verification context types.

use crate::jwks::KeySetHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Prefix of the persisted-token name; the environment ID is appended.
pub const SESSION_COOKIE_PREFIX: &str = "session_";

/// Name under which the session token for an environment is persisted.
#[must_use]
pub fn session_cookie_name(environment_id: &str) -> String {
    format!("{SESSION_COOKIE_PREFIX}{environment_id}")
}

/// Basic user information carried in a session token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    /// User ID (the token subject).
    pub id: String,

    /// Display name, if the provider supplied one.
    pub name: Option<String>,

    /// Email address, if the provider supplied one. Redacted in Debug output.
    pub email: Option<String>,

    /// Avatar URL, if the provider supplied one.
    pub image: Option<String>,
}

impl fmt::Debug for SessionUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionUser")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("email", &self.email.as_ref().map(|_| "[REDACTED]"))
            .field("image", &self.image)
            .finish()
    }
}

/// A verified user session.
///
/// Built only from the claims of a token that passed verification. Sessions
/// are never mutated; each re-verification produces a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// The signed-in user.
    pub user: SessionUser,

    /// Authentication provider used to sign in (e.g. `github`).
    pub provider: String,

    /// Account ID of the user with the provider.
    pub provider_account_id: String,

    /// When the session should be refreshed.
    pub refresh_at: DateTime<Utc>,

    /// When the session expires.
    pub expires: DateTime<Utc>,
}

impl Session {
    /// Whether the session has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires <= now
    }
}

/// API credential resolved into a base URL and environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Base URL of the authentication service for this environment.
    pub base_url: String,

    /// Environment ID; also the expected token audience.
    pub environment_id: String,
}

/// Externally supplied sign-in capability.
///
/// When present on a context, the controller calls it instead of navigating
/// to the sign-in page.
pub trait SignInHook: Send + Sync {
    /// Start the sign-in flow.
    fn sign_in(&self, context: &VerificationContext);
}

/// Everything needed to verify tokens for one environment.
///
/// Immutable once resolved and shared by every verification call.
#[derive(Clone)]
pub struct VerificationContext {
    /// Base URL of the authentication service.
    pub base_url: String,

    /// Environment ID (expected token audience).
    pub environment_id: String,

    /// Verification keys for `base_url`.
    pub key_set: KeySetHandle,

    /// Optional sign-in capability overriding navigation.
    pub sign_in_hook: Option<Arc<dyn SignInHook>>,
}

impl fmt::Debug for VerificationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationContext")
            .field("base_url", &self.base_url)
            .field("environment_id", &self.environment_id)
            .field("key_set", &self.key_set)
            .field("sign_in_hook", &self.sign_in_hook.is_some())
            .finish()
    }
}

impl VerificationContext {
    /// Create a context without a sign-in hook.
    #[must_use]
    pub fn new(base_url: String, environment_id: String, key_set: KeySetHandle) -> Self {
        Self {
            base_url,
            environment_id,
            key_set,
            sign_in_hook: None,
        }
    }

    /// Attach an external sign-in capability.
    #[must_use]
    pub fn with_sign_in_hook(mut self, hook: Arc<dyn SignInHook>) -> Self {
        self.sign_in_hook = Some(hook);
        self
    }

    /// Name of the persisted session token for this environment.
    #[must_use]
    pub fn session_cookie_name(&self) -> String {
        session_cookie_name(&self.environment_id)
    }

    /// Navigation target that starts the sign-in flow.
    #[must_use]
    pub fn sign_in_url(&self) -> String {
        format!("{}/signin", self.base_url)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_session() -> Session {
        Session {
            user: SessionUser {
                id: "user-123".to_string(),
                name: Some("Jane Doe".to_string()),
                email: Some("jane@example.com".to_string()),
                image: None,
            },
            provider: "github".to_string(),
            provider_account_id: "user-123".to_string(),
            refresh_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            expires: Utc.timestamp_opt(1_700_000_300, 0).unwrap(),
        }
    }

    #[test]
    fn test_session_cookie_name() {
        assert_eq!(session_cookie_name("e1"), "session_e1");
    }

    #[test]
    fn test_session_user_debug_redacts_email() {
        let session = sample_session();
        let debug_str = format!("{session:?}");

        assert!(!debug_str.contains("jane@example.com"));
        assert!(debug_str.contains("[REDACTED]"));
        assert!(debug_str.contains("user-123"));
    }

    #[test]
    fn test_session_serializes_absent_fields_as_null() {
        let json = serde_json::to_value(sample_session()).unwrap();

        assert!(json["user"]["image"].is_null());
        assert_eq!(json["user"]["name"], "Jane Doe");
        assert_eq!(json["provider_account_id"], "user-123");
        assert_eq!(json["expires"], "2023-11-14T22:18:20Z");
    }

    #[test]
    fn test_session_expiry_boundary() {
        let session = sample_session();

        assert!(!session.is_expired_at(Utc.timestamp_opt(1_700_000_299, 0).unwrap()));
        assert!(session.is_expired_at(Utc.timestamp_opt(1_700_000_300, 0).unwrap()));
    }
}
