//! Verification context resolution.
//!
//! Composes credential resolution and key-set resolution:
//! API key -> `{base_path}/auth/{environment_id}` -> key set. The result is the
//! immutable [`VerificationContext`] shared by every verification call.

use crate::credentials::CredentialResolver;
use crate::error::{Result, SessionError};
use crate::jwks::KeySetResolver;
use crate::secret::SecretString;
use crate::types::{SignInHook, VerificationContext};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Resolves a [`VerificationContext`] from an API credential.
#[derive(Clone)]
pub struct ContextResolver {
    api_key: SecretString,
    base_path: String,
    credentials: Arc<dyn CredentialResolver>,
    key_sets: KeySetResolver,
    sign_in_hook: Option<Arc<dyn SignInHook>>,
}

impl fmt::Debug for ContextResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextResolver")
            .field("api_key", &"[REDACTED]")
            .field("base_path", &self.base_path)
            .field("key_sets", &self.key_sets)
            .finish_non_exhaustive()
    }
}

impl ContextResolver {
    /// Create a resolver. A trailing `/` on `base_path` is dropped.
    #[must_use]
    pub fn new(
        api_key: SecretString,
        base_path: &str,
        credentials: Arc<dyn CredentialResolver>,
        key_sets: KeySetResolver,
    ) -> Self {
        Self {
            api_key,
            base_path: base_path.trim_end_matches('/').to_string(),
            credentials,
            key_sets,
            sign_in_hook: None,
        }
    }

    /// Attach a sign-in capability to every resolved context.
    #[must_use]
    pub fn with_sign_in_hook(mut self, hook: Arc<dyn SignInHook>) -> Self {
        self.sign_in_hook = Some(hook);
        self
    }

    /// Resolve the context.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::CredentialResolution` if the API key cannot be
    /// resolved, or `SessionError::KeyFetch` if the key set cannot be fetched.
    #[instrument(skip(self), fields(base_path = %self.base_path))]
    pub async fn resolve(&self) -> Result<VerificationContext> {
        let credentials = self
            .credentials
            .resolve(&self.api_key, &self.base_path)
            .await?;
        let key_set = self.key_sets.resolve(&credentials.base_url).await?;

        tracing::info!(
            target: "session.server",
            environment_id = %credentials.environment_id,
            "Verification context resolved"
        );

        let context = VerificationContext::new(
            credentials.base_url,
            credentials.environment_id,
            key_set,
        );
        Ok(match &self.sign_in_hook {
            Some(hook) => context.with_sign_in_hook(Arc::clone(hook)),
            None => context,
        })
    }

    /// Producer for a [`crate::retry::RetryingResolver`].
    ///
    /// Each call resolves the context once; cancellation aborts the attempt.
    pub fn into_producer(
        self,
    ) -> impl Fn(CancellationToken) -> BoxFuture<'static, Result<Arc<VerificationContext>>>
           + Send
           + Sync
           + 'static {
        let resolver = Arc::new(self);
        move |cancel: CancellationToken| {
            let resolver = Arc::clone(&resolver);
            async move {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(SessionError::Closed),
                    result = resolver.resolve() => result.map(Arc::new),
                }
            }
            .boxed()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::jwks::{JwksResponse, KeySetCache, KeySetFetcher};
    use crate::types::Credentials;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedCredentials {
        seen_base_path: Mutex<Option<String>>,
        fail: bool,
    }

    #[async_trait]
    impl CredentialResolver for FixedCredentials {
        async fn resolve(&self, _api_key: &SecretString, base_path: &str) -> Result<Credentials> {
            *self.seen_base_path.lock().unwrap() = Some(base_path.to_string());
            if self.fail {
                return Err(SessionError::CredentialResolution("rejected".to_string()));
            }
            Ok(Credentials {
                base_url: format!("{base_path}/auth/e1"),
                environment_id: "e1".to_string(),
            })
        }
    }

    struct EmptyKeySet;

    #[async_trait]
    impl KeySetFetcher for EmptyKeySet {
        async fn fetch(&self, _jwks_url: &str) -> Result<JwksResponse> {
            Ok(JwksResponse { keys: Vec::new() })
        }
    }

    fn resolver(fail: bool) -> (ContextResolver, Arc<FixedCredentials>) {
        let credentials = Arc::new(FixedCredentials {
            seen_base_path: Mutex::new(None),
            fail,
        });
        let resolver = ContextResolver::new(
            SecretString::from("key-123"),
            "https://api.example/",
            credentials.clone(),
            KeySetResolver::new(KeySetCache::new(), Arc::new(EmptyKeySet)),
        );
        (resolver, credentials)
    }

    #[tokio::test]
    async fn test_resolve_builds_context() {
        let (resolver, credentials) = resolver(false);

        let context = resolver.resolve().await.unwrap();

        assert_eq!(
            credentials.seen_base_path.lock().unwrap().as_deref(),
            Some("https://api.example")
        );
        assert_eq!(context.environment_id, "e1");
        assert_eq!(context.base_url, "https://api.example/auth/e1");
        assert_eq!(
            context.key_set.jwks_url(),
            "https://api.example/auth/e1/.well-known/jwks.json"
        );
        assert!(context.sign_in_hook.is_none());
    }

    #[tokio::test]
    async fn test_resolve_propagates_credential_failure() {
        let (resolver, _) = resolver(true);

        let err = resolver.resolve().await.unwrap_err();
        assert!(matches!(err, SessionError::CredentialResolution(_)));
    }

    #[tokio::test]
    async fn test_producer_honours_cancellation() {
        let (resolver, _) = resolver(false);
        let producer = resolver.into_producer();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(producer(cancel).await.unwrap_err(), SessionError::Closed);

        let context = producer(CancellationToken::new()).await.unwrap();
        assert_eq!(context.environment_id, "e1");
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let (resolver, _) = resolver(false);
        let debug_str = format!("{resolver:?}");

        assert!(!debug_str.contains("key-123"));
        assert!(debug_str.contains("[REDACTED]"));
    }
}
