//! Server-side session helpers.
//!
//! [`ServerAuth`] resolves the verification context lazily in the background
//! (with retries) and verifies the session tokens presented with requests.

use crate::config::SessionConfig;
use crate::context::ContextResolver;
use crate::credentials::HttpCredentialResolver;
use crate::env::TokenStore;
use crate::error::Result;
use crate::jwks::{HttpKeySetFetcher, KeySetCache, KeySetResolver};
use crate::retry::{RetryOptions, RetryState, RetryingResolver};
use crate::secret::ExposeSecret;
use crate::types::{Session, VerificationContext};
use crate::verifier;
use std::sync::Arc;
use tracing::instrument;

/// Server-side session access.
#[derive(Debug)]
pub struct ServerAuth {
    context: RetryingResolver<Arc<VerificationContext>>,
}

impl ServerAuth {
    /// Start resolving the context with `resolver`.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(resolver: ContextResolver, options: RetryOptions) -> Self {
        Self {
            context: RetryingResolver::spawn(resolver.into_producer(), options),
        }
    }

    /// Build from configuration with HTTP collaborators and a fresh key-set cache.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Configuration` if an HTTP client cannot be built.
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        Self::from_config_with_cache(config, KeySetCache::new())
    }

    /// Build from configuration, sharing `cache` with other consumers.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Configuration` if an HTTP client cannot be built.
    pub fn from_config_with_cache(config: &SessionConfig, cache: KeySetCache) -> Result<Self> {
        let credentials = HttpCredentialResolver::with_timeout(config.http_timeout)?;
        let key_sets = KeySetResolver::with_ttl(
            cache,
            Arc::new(HttpKeySetFetcher::with_timeout(config.http_timeout)),
            config.jwks_cache_ttl,
        );
        let resolver = ContextResolver::new(
            config.api_key.clone(),
            &config.base_path,
            Arc::new(credentials),
            key_sets,
        );

        Ok(Self::new(resolver, config.bootstrap_retry_options()))
    }

    /// The verification context, waiting for resolution if needed.
    ///
    /// # Errors
    ///
    /// Returns the resolution failure once retries are spent.
    pub async fn context(&self) -> Result<Arc<VerificationContext>> {
        self.context.wait().await
    }

    /// State of the context resolution.
    #[must_use]
    pub fn context_state(&self) -> RetryState<Arc<VerificationContext>> {
        self.context.state()
    }

    /// Restart context resolution from attempt zero.
    pub fn restart(&self) {
        self.context.restart();
    }

    /// Verify `token` and return its session.
    ///
    /// # Errors
    ///
    /// Returns the context resolution failure, or `SessionError::InvalidToken`.
    #[instrument(skip_all)]
    pub async fn verify_token(&self, token: &str) -> Result<Session> {
        let context = self.context().await?;
        verifier::verify_token(&context, token).await
    }

    /// Session of the token persisted in `store`, if any.
    ///
    /// # Errors
    ///
    /// Verification failures propagate; a missing token is `Ok(None)`.
    #[instrument(skip_all)]
    pub async fn get_session(&self, store: &dyn TokenStore) -> Result<Option<Session>> {
        let context = self.context().await?;
        let Some(token) = store.get(&context.session_cookie_name()) else {
            tracing::debug!(target: "session.server", "No session token presented");
            return Ok(None);
        };

        verifier::verify_token(&context, token.expose_secret())
            .await
            .map(Some)
    }

    /// Where to send the user to sign in.
    ///
    /// # Errors
    ///
    /// Returns the context resolution failure.
    pub async fn sign_in_url(&self) -> Result<String> {
        Ok(self.context().await?.sign_in_url())
    }

    /// Delete the persisted session token.
    ///
    /// # Errors
    ///
    /// Returns the context resolution failure.
    pub async fn sign_out(&self, store: &dyn TokenStore) -> Result<()> {
        let context = self.context().await?;
        store.delete(&context.session_cookie_name());
        tracing::debug!(target: "session.server", "Session token deleted");
        Ok(())
    }

    /// Stop context resolution if it is still running.
    pub fn close(&self) {
        self.context.close();
    }
}
