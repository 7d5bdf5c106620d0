//! Builder patterns for test data construction
//!
//! Provides a fluent API for session token claims.

use crate::crypto_fixtures::TestKeypair;
use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};

/// Builder for session token claims
///
/// Defaults: subject `test-subject`, audience `test-env`, provider `github`,
/// expiry in one hour, refresh in 55 minutes, no profile claims.
///
/// # Example
/// ```rust,ignore
/// let token = TestTokenBuilder::new()
///     .for_user("alice")
///     .for_audience("e1")
///     .expires_in(3600)
///     .sign(&keypair);
/// ```
pub struct TestTokenBuilder {
    sub: String,
    aud: String,
    provider: Option<String>,
    name: Option<String>,
    email: Option<String>,
    picture: Option<String>,
    exp: i64,
    refresh_at: Option<i64>,
}

impl TestTokenBuilder {
    /// Create a new token builder with defaults
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            sub: "test-subject".to_string(),
            aud: "test-env".to_string(),
            provider: Some("github".to_string()),
            name: None,
            email: None,
            picture: None,
            exp: (now + Duration::seconds(3600)).timestamp(),
            refresh_at: Some((now + Duration::seconds(3300)).timestamp()),
        }
    }

    /// Set the subject (user ID)
    pub fn for_user(mut self, subject: &str) -> Self {
        self.sub = subject.to_string();
        self
    }

    /// Set the audience (environment ID)
    pub fn for_audience(mut self, audience: &str) -> Self {
        self.aud = audience.to_string();
        self
    }

    /// Set the provider, or drop the claim with `None`
    pub fn with_provider(mut self, provider: Option<&str>) -> Self {
        self.provider = provider.map(ToString::to_string);
        self
    }

    /// Set the display name
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Set the email
    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    /// Set the avatar URL
    pub fn with_picture(mut self, picture: &str) -> Self {
        self.picture = Some(picture.to_string());
        self
    }

    /// Set expiration in seconds from now (negative for the past)
    pub fn expires_in(mut self, seconds: i64) -> Self {
        self.exp = (Utc::now() + Duration::seconds(seconds)).timestamp();
        self
    }

    /// Set the refresh instant in seconds from now
    pub fn refresh_in(mut self, seconds: i64) -> Self {
        self.refresh_at = Some((Utc::now() + Duration::seconds(seconds)).timestamp());
        self
    }

    /// Drop the `refresh_at` claim
    pub fn without_refresh_at(mut self) -> Self {
        self.refresh_at = None;
        self
    }

    /// Build the claims as a JSON value
    pub fn build(self) -> Value {
        let mut claims = Map::new();
        claims.insert("sub".to_string(), json!(self.sub));
        claims.insert("aud".to_string(), json!(self.aud));
        claims.insert("exp".to_string(), json!(self.exp));
        claims.insert("iat".to_string(), json!(Utc::now().timestamp()));
        for (name, value) in [
            ("provider", self.provider),
            ("name", self.name),
            ("email", self.email),
            ("picture", self.picture),
        ] {
            if let Some(value) = value {
                claims.insert(name.to_string(), json!(value));
            }
        }
        if let Some(refresh_at) = self.refresh_at {
            claims.insert("refresh_at".to_string(), json!(refresh_at));
        }
        Value::Object(claims)
    }

    /// Build and sign with `keypair` (with a `kid` header)
    pub fn sign(self, keypair: &TestKeypair) -> String {
        keypair.sign(&self.build())
    }
}

impl Default for TestTokenBuilder {
    fn default() -> Self {
        Self::new()
    }
}
