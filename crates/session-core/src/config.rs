//! Session core configuration.
//!
//! Configuration is loaded from environment variables. The API key is held
//! as `SecretString` and redacted in Debug output.

use crate::controller::ControllerConfig;
use crate::jwks::{DEFAULT_CACHE_TTL_SECONDS, DEFAULT_HTTP_TIMEOUT_SECONDS};
use crate::refresh::RefreshPolicy;
use crate::retry::{RetryOptions, DEFAULT_MAX_ATTEMPTS};
use crate::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Maximum key material lifetime in seconds (1 day).
pub const MAX_CACHE_TTL_SECONDS: u64 = 86_400;

/// Maximum HTTP timeout in seconds.
pub const MAX_HTTP_TIMEOUT_SECONDS: u64 = 120;

/// Default refresh backoff cap in seconds.
pub const DEFAULT_REFRESH_MAX_BACKOFF_SECONDS: u64 = 30;

/// Session core configuration.
#[derive(Clone)]
pub struct SessionConfig {
    /// API credential of the application.
    pub api_key: SecretString,

    /// Base path of the auth service (no trailing `/`).
    pub base_path: String,

    /// Lifetime of cached key material (default: 300s).
    pub jwks_cache_ttl: Duration,

    /// Timeout of every outbound HTTP request (default: 10s).
    pub http_timeout: Duration,

    /// Attempts to resolve the verification context (default: 11).
    pub bootstrap_max_attempts: u32,

    /// Cap on the refresh backoff (default: 30s).
    pub refresh_max_backoff: Duration,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("api_key", &"[REDACTED]")
            .field("base_path", &self.base_path)
            .field("jwks_cache_ttl", &self.jwks_cache_ttl)
            .field("http_timeout", &self.http_timeout)
            .field("bootstrap_max_attempts", &self.bootstrap_max_attempts)
            .field("refresh_max_backoff", &self.refresh_max_backoff)
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl SessionConfig {
    /// Configuration with defaults for everything but the credential.
    #[must_use]
    pub fn new(api_key: SecretString, base_path: &str) -> Self {
        Self {
            api_key,
            base_path: base_path.trim_end_matches('/').to_string(),
            jwks_cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECONDS),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECONDS),
            bootstrap_max_attempts: DEFAULT_MAX_ATTEMPTS,
            refresh_max_backoff: Duration::from_secs(DEFAULT_REFRESH_MAX_BACKOFF_SECONDS),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a value is invalid.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let api_key = vars
            .get("AUTH_API_KEY")
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("AUTH_API_KEY".to_string()))?;

        let base_path = vars
            .get("AUTH_BASE_PATH")
            .map(|value| value.trim_end_matches('/'))
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("AUTH_BASE_PATH".to_string()))?;

        let jwks_cache_ttl = parse_seconds(
            vars,
            "AUTH_JWKS_CACHE_TTL_SECONDS",
            DEFAULT_CACHE_TTL_SECONDS,
            MAX_CACHE_TTL_SECONDS,
        )?;

        let http_timeout = parse_seconds(
            vars,
            "AUTH_HTTP_TIMEOUT_SECONDS",
            DEFAULT_HTTP_TIMEOUT_SECONDS,
            MAX_HTTP_TIMEOUT_SECONDS,
        )?;

        let bootstrap_max_attempts = if let Some(value_str) = vars.get("AUTH_BOOTSTRAP_MAX_ATTEMPTS") {
            let value: u32 = value_str.parse().map_err(|e| {
                ConfigError::InvalidValue(format!(
                    "AUTH_BOOTSTRAP_MAX_ATTEMPTS must be a valid positive integer, got '{value_str}': {e}"
                ))
            })?;
            if value == 0 {
                return Err(ConfigError::InvalidValue(
                    "AUTH_BOOTSTRAP_MAX_ATTEMPTS must be greater than 0".to_string(),
                ));
            }
            value
        } else {
            DEFAULT_MAX_ATTEMPTS
        };

        let refresh_max_backoff = parse_seconds(
            vars,
            "AUTH_REFRESH_MAX_BACKOFF_SECONDS",
            DEFAULT_REFRESH_MAX_BACKOFF_SECONDS,
            u64::MAX,
        )?;

        Ok(Self {
            api_key: SecretString::from(api_key.clone()),
            base_path: base_path.to_string(),
            jwks_cache_ttl,
            http_timeout,
            bootstrap_max_attempts,
            refresh_max_backoff,
        })
    }

    /// Set the key material lifetime.
    #[must_use]
    pub fn with_jwks_cache_ttl(mut self, ttl: Duration) -> Self {
        self.jwks_cache_ttl = ttl;
        self
    }

    /// Set the HTTP timeout.
    #[must_use]
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Set the context resolution attempt budget.
    #[must_use]
    pub fn with_bootstrap_max_attempts(mut self, attempts: u32) -> Self {
        self.bootstrap_max_attempts = attempts;
        self
    }

    /// Set the refresh backoff cap.
    #[must_use]
    pub fn with_refresh_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.refresh_max_backoff = max_backoff;
        self
    }

    /// Retry options for verification context resolution.
    #[must_use]
    pub fn bootstrap_retry_options(&self) -> RetryOptions {
        RetryOptions::default().with_max_attempts(self.bootstrap_max_attempts)
    }

    /// Backoff policy of refresh chains.
    #[must_use]
    pub fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            max_backoff: self.refresh_max_backoff,
            ..RefreshPolicy::default()
        }
    }

    /// Controller tuning derived from this configuration.
    #[must_use]
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            bootstrap: self.bootstrap_retry_options(),
            refresh: self.refresh_policy(),
        }
    }
}

/// Parse a positive number of seconds no greater than `max`.
fn parse_seconds(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
    max: u64,
) -> Result<Duration, ConfigError> {
    let Some(value_str) = vars.get(name) else {
        return Ok(Duration::from_secs(default));
    };

    let value: u64 = value_str.parse().map_err(|e| {
        ConfigError::InvalidValue(format!(
            "{name} must be a valid positive integer, got '{value_str}': {e}"
        ))
    })?;

    if value == 0 {
        return Err(ConfigError::InvalidValue(format!(
            "{name} must be greater than 0"
        )));
    }

    if value > max {
        return Err(ConfigError::InvalidValue(format!(
            "{name} must not exceed {max} seconds, got {value}"
        )));
    }

    Ok(Duration::from_secs(value))
}
