//! JWT utilities: pre-verification header inspection and session claims.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (DoS prevention)
//! - Header inspection never trusts the token; it only selects candidate keys
//! - The `sub` and `email` claims are redacted in Debug output

use crate::error::InvalidTokenError;
use crate::types::{Session, SessionUser};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Constants
// =============================================================================

/// Maximum allowed JWT size in bytes (8KB).
///
/// Session tokens carry a handful of profile claims and are typically well
/// under 1KB. Anything larger is rejected before base64 decoding or any
/// cryptographic work.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Claims every session token must carry.
pub const REQUIRED_CLAIMS: [&str; 3] = ["sub", "exp", "aud"];

// =============================================================================
// Claims Types
// =============================================================================

/// Claims of a session token.
///
/// `aud` is checked by the verifier and is not needed after verification.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject (user ID) - redacted in Debug output.
    pub sub: String,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,

    /// Display name.
    #[serde(default)]
    pub name: Option<String>,

    /// Email address - redacted in Debug output.
    #[serde(default)]
    pub email: Option<String>,

    /// Avatar URL.
    #[serde(default)]
    pub picture: Option<String>,

    /// Authentication provider ID.
    pub provider: String,

    /// Refresh instant (Unix epoch seconds). Falls back to `exp` when absent.
    #[serde(default)]
    pub refresh_at: Option<i64>,
}

impl fmt::Debug for SessionClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionClaims")
            .field("sub", &"[REDACTED]")
            .field("exp", &self.exp)
            .field("name", &self.name)
            .field("email", &self.email.as_ref().map(|_| "[REDACTED]"))
            .field("picture", &self.picture)
            .field("provider", &self.provider)
            .field("refresh_at", &self.refresh_at)
            .finish()
    }
}

impl SessionClaims {
    /// Map verified claims to a [`Session`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidTokenError` if a timestamp is outside the representable range.
    pub fn into_session(self) -> Result<Session, InvalidTokenError> {
        let expires = timestamp(self.exp)?;
        let refresh_at = match self.refresh_at {
            Some(secs) => timestamp(secs)?,
            None => expires,
        };

        Ok(Session {
            user: SessionUser {
                id: self.sub.clone(),
                name: self.name,
                email: self.email,
                image: self.picture,
            },
            provider: self.provider,
            provider_account_id: self.sub,
            refresh_at,
            expires,
        })
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, InvalidTokenError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| InvalidTokenError::new("timestamp claim out of range"))
}

// =============================================================================
// Functions
// =============================================================================

/// Read the optional `kid` (key ID) from a JWT header without verifying it.
///
/// Used only to pick candidate keys during key rotation; the token MUST still
/// be verified afterwards.
///
/// # Errors
///
/// Returns `InvalidTokenError` if the token is too large, is not three
/// dot-separated parts, or has a header that is not base64url JSON.
pub fn peek_kid(token: &str) -> Result<Option<String>, InvalidTokenError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "session.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(InvalidTokenError::new("token too large"));
    }

    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 || parts.iter().any(|part| part.is_empty()) {
        tracing::debug!(
            target: "session.jwt",
            parts = parts.len(),
            "Token rejected: invalid JWT format"
        );
        return Err(InvalidTokenError::new("malformed token"));
    }

    let header_part = parts
        .first()
        .ok_or_else(|| InvalidTokenError::new("malformed token"))?;
    let header_bytes = URL_SAFE_NO_PAD.decode(header_part).map_err(|e| {
        tracing::debug!(target: "session.jwt", error = %e, "Failed to decode JWT header base64");
        InvalidTokenError::new("malformed token")
    })?;

    let header: serde_json::Value = serde_json::from_slice(&header_bytes).map_err(|e| {
        tracing::debug!(target: "session.jwt", error = %e, "Failed to parse JWT header JSON");
        InvalidTokenError::new("malformed token")
    })?;

    Ok(header
        .get("kid")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(ToString::to_string))
}

// =============================================================================
// Tests
// =============================================================================
