//! Session refresh.
//!
//! Exchanges the current session token for a fresh one at
//! `POST {base_url}/session` (bearer-authenticated). The new token arrives in
//! the `X-Session-Token` response header.
//!
//! # Retry policy
//!
//! Every failure is treated as transient: non-2xx responses, transport errors
//! and a 2xx response without the header are all retried with exponential
//! backoff (1s, 2s, 4s, ..., max 30s). The chain ends on success, when the
//! session's `expires` instant passes, when an optional attempt budget is
//! spent, or on cancellation.

use crate::env::Clock;
use crate::error::{Result, SessionError};
use crate::secret::{ExposeSecret, SecretString};
use crate::types::Session;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Response header carrying the refreshed token.
pub const SESSION_TOKEN_HEADER: &str = "X-Session-Token";

/// Initial backoff delay for retry.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Maximum backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Default HTTP timeout for refresh requests.
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Refresh endpoint under a base URL.
#[must_use]
pub fn refresh_url(base_url: &str) -> String {
    format!("{base_url}/session")
}

/// Exchanges a session token for a fresh one.
#[async_trait]
pub trait SessionRefresher: Send + Sync {
    /// Refresh `token` against the service at `base_url`.
    ///
    /// Implementations should abandon the request when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::RefreshTransport` for any failure, or
    /// `SessionError::Closed` if cancelled.
    async fn refresh(
        &self,
        base_url: &str,
        token: &SecretString,
        cancel: &CancellationToken,
    ) -> Result<SecretString>;
}

/// HTTP [`SessionRefresher`].
#[derive(Debug, Clone)]
pub struct HttpSessionRefresher {
    http_client: Client,
}

impl Default for HttpSessionRefresher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpSessionRefresher {
    /// Create a refresher with the default timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_HTTP_TIMEOUT)
    }

    /// Create a refresher with a custom request timeout.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(target: "session.refresh", error = %e, "Failed to build HTTP client with custom config, using defaults");
                Client::new()
            });

        Self { http_client }
    }

    async fn request(&self, base_url: &str, token: &SecretString) -> Result<SecretString> {
        let url = refresh_url(base_url);

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| {
                debug!(target: "session.refresh", error = %e, "Refresh request failed");
                SessionError::RefreshTransport("refresh request failed".to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(target: "session.refresh", status = %status, "Refresh endpoint returned error");
            return Err(SessionError::RefreshTransport(format!(
                "refresh endpoint returned {}",
                status.as_u16()
            )));
        }

        let header = response
            .headers()
            .get(SESSION_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                warn!(target: "session.refresh", status = %status, "Refresh response missing session token header");
                SessionError::RefreshTransport("missing session token header".to_string())
            })?;

        Ok(SecretString::from(header.to_string()))
    }
}

#[async_trait]
impl SessionRefresher for HttpSessionRefresher {
    #[instrument(skip_all)]
    async fn refresh(
        &self,
        base_url: &str,
        token: &SecretString,
        cancel: &CancellationToken,
    ) -> Result<SecretString> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(SessionError::Closed),
            result = self.request(base_url, token) => result,
        }
    }
}

/// Backoff policy of one refresh chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Delay after the first failure.
    pub initial_backoff: Duration,

    /// Cap on the delay between attempts.
    pub max_backoff: Duration,

    /// Backoff growth factor.
    pub factor: u32,

    /// Attempt budget per chain; `None` retries until expiry.
    pub max_attempts: Option<u32>,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
            factor: 2,
            max_attempts: None,
        }
    }
}

impl RefreshPolicy {
    /// Delay after the failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = delay.saturating_mul(self.factor);
            if delay >= self.max_backoff {
                return self.max_backoff;
            }
        }
        delay.min(self.max_backoff)
    }
}

/// How a refresh chain ended.
#[derive(Debug)]
pub enum RefreshOutcome {
    /// A fresh token was obtained.
    Refreshed(SecretString),

    /// The session expired before a refresh succeeded.
    Expired,

    /// The attempt budget was spent before expiry.
    Exhausted,

    /// The chain was cancelled.
    Cancelled,
}

/// Retry refreshing `token`, the token of `session`, until success, expiry
/// of `session`, budget exhaustion or cancellation.
#[instrument(skip_all)]
pub async fn refresh_until_expiry(
    refresher: &dyn SessionRefresher,
    base_url: &str,
    token: &SecretString,
    session: &Session,
    clock: &dyn Clock,
    policy: &RefreshPolicy,
    cancel: &CancellationToken,
) -> RefreshOutcome {
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return RefreshOutcome::Cancelled;
        }
        if session.is_expired_at(clock.now()) {
            return RefreshOutcome::Expired;
        }

        attempt = attempt.saturating_add(1);
        let result = refresher.refresh(base_url, token, cancel).await;
        if cancel.is_cancelled() {
            return RefreshOutcome::Cancelled;
        }

        let err = match result {
            Ok(new_token) => {
                debug!(target: "session.refresh", attempt, "Session refreshed");
                return RefreshOutcome::Refreshed(new_token);
            }
            Err(err) => err,
        };

        if policy.max_attempts.is_some_and(|max| attempt >= max) {
            warn!(
                target: "session.refresh",
                attempts = attempt,
                error = %err,
                "Refresh attempts exhausted"
            );
            return RefreshOutcome::Exhausted;
        }

        let now = clock.now();
        if session.is_expired_at(now) {
            return RefreshOutcome::Expired;
        }

        // Never sleep past expiry.
        let remaining = (session.expires - now).to_std().unwrap_or(Duration::ZERO);
        let backoff = policy.backoff(attempt).min(remaining);
        warn!(
            target: "session.refresh",
            attempt,
            error = %err,
            backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
            "Session refresh failed, will retry"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return RefreshOutcome::Cancelled,
            () = tokio::time::sleep(backoff) => {}
        }
    }
}
