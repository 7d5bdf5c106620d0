//! API credential resolution.
//!
//! Exchanges the application's API key for the environment it belongs to.
//! The resolved base URL is `{base_path}/auth/{environment_id}`.
//!
//! # Security
//!
//! - The API key is held as `SecretString` and only exposed in the request header
//! - Timeouts prevent hanging connections
//! - Errors are logged with detail and returned with generic messages

use crate::error::{Result, SessionError};
use crate::secret::{ExposeSecret, SecretString};
use crate::types::Credentials;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, instrument, warn};

/// Default timeout for credential requests in seconds.
const CREDENTIAL_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Response of the API key details endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyDetails {
    /// Environment the key belongs to.
    pub environment_id: String,
}

/// Resolves an API credential into a base URL and environment.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Resolve `api_key` against the service at `base_path`.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::CredentialResolution` if the key cannot be resolved.
    async fn resolve(&self, api_key: &SecretString, base_path: &str) -> Result<Credentials>;
}

/// Base URL of the auth service for an environment.
#[must_use]
pub fn auth_base_url(base_path: &str, environment_id: &str) -> String {
    format!("{base_path}/auth/{environment_id}")
}

/// HTTP credential resolver.
#[derive(Debug, Clone)]
pub struct HttpCredentialResolver {
    client: Client,
}

impl HttpCredentialResolver {
    /// Create a resolver with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Configuration` if the HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(CREDENTIAL_REQUEST_TIMEOUT_SECS))
    }

    /// Create a resolver with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Configuration` if the HTTP client cannot be built.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| {
                error!(target: "session.credentials", error = %e, "Failed to build HTTP client");
                SessionError::Configuration("HTTP client unavailable".to_string())
            })?;

        Ok(Self { client })
    }
}

#[async_trait]
impl CredentialResolver for HttpCredentialResolver {
    #[instrument(skip(self, api_key))]
    async fn resolve(&self, api_key: &SecretString, base_path: &str) -> Result<Credentials> {
        let url = format!("{base_path}/auth/apiKeyDetails");

        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, api_key.expose_secret())
            .send()
            .await
            .map_err(|e| {
                warn!(target: "session.credentials", error = %e, "API key details request failed");
                SessionError::CredentialResolution("auth service unavailable".to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            if status.as_u16() == 401 || status.as_u16() == 403 {
                error!(target: "session.credentials", status = %status, "API key rejected");
            } else {
                warn!(target: "session.credentials", status = %status, "Unexpected API key details response");
            }
            return Err(SessionError::CredentialResolution(format!(
                "API key details returned {}",
                status.as_u16()
            )));
        }

        let details: ApiKeyDetails = response.json().await.map_err(|e| {
            error!(target: "session.credentials", error = %e, "Failed to parse API key details");
            SessionError::CredentialResolution("malformed API key details".to_string())
        })?;

        if details.environment_id.is_empty() {
            return Err(SessionError::CredentialResolution(
                "API key details missing environment".to_string(),
            ));
        }

        tracing::debug!(
            target: "session.credentials",
            environment_id = %details.environment_id,
            "API key resolved"
        );

        Ok(Credentials {
            base_url: auth_base_url(base_path, &details.environment_id),
            environment_id: details.environment_id,
        })
    }
}
