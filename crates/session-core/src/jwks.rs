//! Key-set client for fetching and caching verification keys.
//!
//! Keys are published by the authentication service at
//! `{base_url}/.well-known/jwks.json`. Each [`KeySetHandle`] caches the listing
//! for a bounded lifetime so that key rotations are picked up; handles
//! themselves live in a process-wide [`KeySetCache`] keyed by base URL.
//!
//! # Security
//!
//! - Keys are cached to reduce load on the auth service and improve latency
//! - Cache is refreshed on TTL expiry to pick up key rotations
//! - Unknown key IDs trigger a rate-limited early refetch
//! - HTTPS should be used in production (enforced by deployment config)

use crate::error::{Result, SessionError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::instrument;

/// Default key material lifetime in seconds (5 minutes).
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 300;

/// Default HTTP timeout for key-set fetches in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECONDS: u64 = 10;

/// Minimum interval between refetches of one key set.
pub const MIN_REFETCH_INTERVAL: Duration = Duration::from_secs(30);

/// Key-set URL published under a base URL.
#[must_use]
pub fn jwks_url(base_url: &str) -> String {
    format!("{base_url}/.well-known/jwks.json")
}

/// JSON Web Key from the key-set endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type (`OKP`, `RSA` or `EC`).
    pub kty: String,

    /// Key ID - used to select the correct key for verification.
    #[serde(default)]
    pub kid: Option<String>,

    /// Curve name (`Ed25519`, `P-256`, `P-384`).
    #[serde(default)]
    pub crv: Option<String>,

    /// Public key value or EC x coordinate (base64url encoded).
    #[serde(default)]
    pub x: Option<String>,

    /// EC y coordinate (base64url encoded).
    #[serde(default)]
    pub y: Option<String>,

    /// RSA modulus (base64url encoded).
    #[serde(default)]
    pub n: Option<String>,

    /// RSA exponent (base64url encoded).
    #[serde(default)]
    pub e: Option<String>,

    /// Algorithm.
    #[serde(default)]
    pub alg: Option<String>,

    /// Key use (should be "sig" for signing).
    #[serde(default, rename = "use")]
    pub key_use: Option<String>,
}

/// Key-set listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwksResponse {
    /// List of JSON Web Keys, in published order.
    pub keys: Vec<Jwk>,
}

/// Source of key-set listings.
#[async_trait]
pub trait KeySetFetcher: Send + Sync {
    /// Fetch the key-set listing at `jwks_url`.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::KeyFetch` if the listing is unreachable,
    /// answered with a non-2xx status, or malformed.
    async fn fetch(&self, jwks_url: &str) -> Result<JwksResponse>;
}

/// Fetches key sets over HTTP.
#[derive(Debug, Clone)]
pub struct HttpKeySetFetcher {
    http_client: reqwest::Client,
}

impl Default for HttpKeySetFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpKeySetFetcher {
    /// Create a fetcher with the default timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECONDS))
    }

    /// Create a fetcher with a custom request timeout.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(target: "session.jwks", error = %e, "Failed to build HTTP client with custom config, using defaults");
                reqwest::Client::new()
            });

        Self { http_client }
    }
}

#[async_trait]
impl KeySetFetcher for HttpKeySetFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, jwks_url: &str) -> Result<JwksResponse> {
        tracing::debug!(target: "session.jwks", url = %jwks_url, "Fetching key set");

        let response = self.http_client.get(jwks_url).send().await.map_err(|e| {
            tracing::error!(target: "session.jwks", error = %e, "Failed to fetch key set");
            SessionError::KeyFetch("key set unreachable".to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(
                target: "session.jwks",
                status = %status,
                "Key set endpoint returned error"
            );
            return Err(SessionError::KeyFetch(format!(
                "key set endpoint returned {}",
                status.as_u16()
            )));
        }

        response.json::<JwksResponse>().await.map_err(|e| {
            tracing::error!(target: "session.jwks", error = %e, "Failed to parse key set response");
            SessionError::KeyFetch("malformed key set".to_string())
        })
    }
}

/// Cached key material with its lifetime.
struct CachedKeys {
    keys: Arc<Vec<Jwk>>,
    expires_at: Instant,
    fetched_at: Instant,
}

struct KeySetInner {
    jwks_url: String,
    fetcher: Arc<dyn KeySetFetcher>,
    cache: RwLock<CachedKeys>,
    ttl: Duration,
}

/// Shared reference to one remote key set.
///
/// Cheap to clone. Key material is refreshed on TTL expiry; when a refresh
/// fails the previous keys keep being served until a later refresh succeeds.
#[derive(Clone)]
pub struct KeySetHandle {
    inner: Arc<KeySetInner>,
}

impl fmt::Debug for KeySetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySetHandle")
            .field("jwks_url", &self.inner.jwks_url)
            .field("ttl", &self.inner.ttl)
            .finish_non_exhaustive()
    }
}

impl KeySetHandle {
    /// Fetch the key set at `jwks_url` and wrap it in a handle.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::KeyFetch` if the initial fetch fails.
    pub async fn load(
        jwks_url: String,
        fetcher: Arc<dyn KeySetFetcher>,
        ttl: Duration,
    ) -> Result<Self> {
        let listing = fetcher.fetch(&jwks_url).await?;
        let now = Instant::now();

        tracing::info!(
            target: "session.jwks",
            url = %jwks_url,
            key_count = listing.keys.len(),
            "Key set loaded"
        );

        Ok(Self {
            inner: Arc::new(KeySetInner {
                jwks_url,
                fetcher,
                cache: RwLock::new(CachedKeys {
                    keys: Arc::new(listing.keys),
                    expires_at: now + ttl,
                    fetched_at: now,
                }),
                ttl,
            }),
        })
    }

    /// URL this key set is fetched from.
    #[must_use]
    pub fn jwks_url(&self) -> &str {
        &self.inner.jwks_url
    }

    /// Current key material, refreshing it first if its lifetime elapsed.
    pub async fn keys(&self) -> Arc<Vec<Jwk>> {
        {
            let cache = self.inner.cache.read().await;
            if cache.expires_at > Instant::now() {
                tracing::debug!(target: "session.jwks", "Key set cache hit");
                return Arc::clone(&cache.keys);
            }
        }

        let mut cache = self.inner.cache.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if cache.expires_at > Instant::now() {
            return Arc::clone(&cache.keys);
        }

        self.refetch(&mut cache).await;
        Arc::clone(&cache.keys)
    }

    /// Refetch early because a token named a key ID not in the set.
    ///
    /// Returns the new key material, or `None` if a refetch happened too
    /// recently or failed.
    pub async fn refresh_for_unknown_kid(&self) -> Option<Arc<Vec<Jwk>>> {
        let mut cache = self.inner.cache.write().await;
        if cache.fetched_at + MIN_REFETCH_INTERVAL > Instant::now() {
            tracing::debug!(
                target: "session.jwks",
                url = %self.inner.jwks_url,
                "Early refetch suppressed, key set fetched recently"
            );
            return None;
        }

        if self.refetch(&mut cache).await {
            Some(Arc::clone(&cache.keys))
        } else {
            None
        }
    }

    /// Replace the cached keys. On failure the stale keys stay and the next
    /// attempt is deferred by [`MIN_REFETCH_INTERVAL`].
    async fn refetch(&self, cache: &mut CachedKeys) -> bool {
        let now = Instant::now();
        match self.inner.fetcher.fetch(&self.inner.jwks_url).await {
            Ok(listing) => {
                tracing::info!(
                    target: "session.jwks",
                    url = %self.inner.jwks_url,
                    key_count = listing.keys.len(),
                    "Key set refreshed"
                );
                cache.keys = Arc::new(listing.keys);
                cache.expires_at = now + self.inner.ttl;
                cache.fetched_at = now;
                true
            }
            Err(e) => {
                tracing::warn!(
                    target: "session.jwks",
                    url = %self.inner.jwks_url,
                    error = %e,
                    "Key set refresh failed, serving stale keys"
                );
                cache.expires_at = now + MIN_REFETCH_INTERVAL;
                cache.fetched_at = now;
                false
            }
        }
    }
}

/// Process-wide key-set cache, keyed by base URL.
///
/// Entries are created on first use and never evicted.
#[derive(Clone, Default)]
pub struct KeySetCache {
    handles: Arc<RwLock<HashMap<String, KeySetHandle>>>,
}

impl fmt::Debug for KeySetCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySetCache").finish_non_exhaustive()
    }
}

impl KeySetCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached handle for `base_url`, if any.
    pub async fn get(&self, base_url: &str) -> Option<KeySetHandle> {
        self.handles.read().await.get(base_url).cloned()
    }

    /// Store `handle` unless one already exists; returns the stored handle.
    pub async fn insert_if_absent(&self, base_url: &str, handle: KeySetHandle) -> KeySetHandle {
        let mut handles = self.handles.write().await;
        handles
            .entry(base_url.to_string())
            .or_insert(handle)
            .clone()
    }

    /// Number of cached key sets.
    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.handles.read().await.is_empty()
    }
}

/// Resolves base URLs to key-set handles through a shared cache.
#[derive(Clone)]
pub struct KeySetResolver {
    cache: KeySetCache,
    fetcher: Arc<dyn KeySetFetcher>,
    ttl: Duration,
}

impl fmt::Debug for KeySetResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySetResolver")
            .field("cache", &self.cache)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl KeySetResolver {
    /// Create a resolver with the default key lifetime.
    #[must_use]
    pub fn new(cache: KeySetCache, fetcher: Arc<dyn KeySetFetcher>) -> Self {
        Self::with_ttl(
            cache,
            fetcher,
            Duration::from_secs(DEFAULT_CACHE_TTL_SECONDS),
        )
    }

    /// Create a resolver with a custom key lifetime.
    #[must_use]
    pub fn with_ttl(cache: KeySetCache, fetcher: Arc<dyn KeySetFetcher>, ttl: Duration) -> Self {
        Self {
            cache,
            fetcher,
            ttl,
        }
    }

    /// The shared cache backing this resolver.
    #[must_use]
    pub fn cache(&self) -> &KeySetCache {
        &self.cache
    }

    /// Handle for the key set published under `base_url`.
    ///
    /// The first call per base URL fetches; later calls hit the cache.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::KeyFetch` if the first fetch fails. Failures are
    /// not retried here.
    #[instrument(skip(self))]
    pub async fn resolve(&self, base_url: &str) -> Result<KeySetHandle> {
        if let Some(handle) = self.cache.get(base_url).await {
            tracing::debug!(target: "session.jwks", base_url = %base_url, "Key set handle cache hit");
            return Ok(handle);
        }

        let handle =
            KeySetHandle::load(jwks_url(base_url), Arc::clone(&self.fetcher), self.ttl).await?;
        Ok(self.cache.insert_if_absent(base_url, handle).await)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingFetcher {
        calls: AtomicUsize,
        responses: Mutex<Vec<Result<JwksResponse>>>,
    }

    impl CountingFetcher {
        fn new(responses: Vec<Result<JwksResponse>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                responses: Mutex::new(responses),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KeySetFetcher for CountingFetcher {
        async fn fetch(&self, _jwks_url: &str) -> Result<JwksResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.remove(0)
            } else {
                responses.first().cloned().unwrap()
            }
        }
    }

    fn listing(kids: &[&str]) -> JwksResponse {
        JwksResponse {
            keys: kids
                .iter()
                .map(|kid| Jwk {
                    kty: "OKP".to_string(),
                    kid: Some((*kid).to_string()),
                    crv: Some("Ed25519".to_string()),
                    x: Some("dGVzdC1wdWJsaWMta2V5LWRhdGE".to_string()),
                    y: None,
                    n: None,
                    e: None,
                    alg: Some("EdDSA".to_string()),
                    key_use: Some("sig".to_string()),
                })
                .collect(),
        }
    }

    fn kids(keys: &[Jwk]) -> Vec<String> {
        keys.iter().filter_map(|k| k.kid.clone()).collect()
    }

    #[test]
    fn test_jwk_deserialization() {
        let json = r#"{
            "kty": "OKP",
            "kid": "test-key-01",
            "crv": "Ed25519",
            "x": "dGVzdC1wdWJsaWMta2V5LWRhdGE",
            "alg": "EdDSA",
            "use": "sig"
        }"#;

        let jwk: Jwk = serde_json::from_str(json).unwrap();

        assert_eq!(jwk.kty, "OKP");
        assert_eq!(jwk.kid.as_deref(), Some("test-key-01"));
        assert_eq!(jwk.crv.as_deref(), Some("Ed25519"));
        assert_eq!(jwk.alg.as_deref(), Some("EdDSA"));
        assert_eq!(jwk.key_use.as_deref(), Some("sig"));
    }

    #[test]
    fn test_jwk_deserialization_rsa_without_kid() {
        let json = r#"{"kty": "RSA", "n": "sXchDaQebHnPiGvyDOAT4saGEUetSyo9MKLOoWFsueri", "e": "AQAB"}"#;

        let jwk: Jwk = serde_json::from_str(json).unwrap();

        assert_eq!(jwk.kty, "RSA");
        assert!(jwk.kid.is_none());
        assert_eq!(jwk.e.as_deref(), Some("AQAB"));
        assert!(jwk.x.is_none());
    }

    #[test]
    fn test_jwks_url() {
        assert_eq!(
            jwks_url("https://auth.example/auth/e1"),
            "https://auth.example/auth/e1/.well-known/jwks.json"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_served_from_cache_within_ttl() {
        let fetcher = CountingFetcher::new(vec![Ok(listing(&["k1"]))]);
        let handle = KeySetHandle::load(
            "https://auth.example/jwks".to_string(),
            fetcher.clone(),
            Duration::from_secs(300),
        )
        .await
        .unwrap();

        tokio::time::advance(Duration::from_secs(299)).await;
        let keys = handle.keys().await;

        assert_eq!(kids(&keys), vec!["k1"]);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_refetched_after_ttl() {
        let fetcher = CountingFetcher::new(vec![Ok(listing(&["k1"])), Ok(listing(&["k2"]))]);
        let handle = KeySetHandle::load(
            "https://auth.example/jwks".to_string(),
            fetcher.clone(),
            Duration::from_secs(300),
        )
        .await
        .unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        let keys = handle.keys().await;

        assert_eq!(kids(&keys), vec!["k2"]);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_keys_served_when_refetch_fails() {
        let fetcher = CountingFetcher::new(vec![
            Ok(listing(&["k1"])),
            Err(SessionError::KeyFetch("down".to_string())),
        ]);
        let handle = KeySetHandle::load(
            "https://auth.example/jwks".to_string(),
            fetcher.clone(),
            Duration::from_secs(300),
        )
        .await
        .unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(kids(&handle.keys().await), vec!["k1"]);

        // The failed refetch defers the next attempt.
        assert_eq!(kids(&handle.keys().await), vec!["k1"]);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_kid_refetch_is_rate_limited() {
        let fetcher = CountingFetcher::new(vec![Ok(listing(&["k1"])), Ok(listing(&["k1", "k2"]))]);
        let handle = KeySetHandle::load(
            "https://auth.example/jwks".to_string(),
            fetcher.clone(),
            Duration::from_secs(300),
        )
        .await
        .unwrap();

        assert!(handle.refresh_for_unknown_kid().await.is_none());
        assert_eq!(fetcher.calls(), 1);

        tokio::time::advance(MIN_REFETCH_INTERVAL).await;
        let keys = handle.refresh_for_unknown_kid().await.unwrap();
        assert_eq!(kids(&keys), vec!["k1", "k2"]);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_resolver_fetches_once_per_base_url() {
        let fetcher = CountingFetcher::new(vec![Ok(listing(&["k1"]))]);
        let resolver = KeySetResolver::new(KeySetCache::new(), fetcher.clone());

        let first = resolver.resolve("https://auth.example/a").await.unwrap();
        let second = resolver.resolve("https://auth.example/a").await.unwrap();

        assert_eq!(first.jwks_url(), second.jwks_url());
        assert_eq!(fetcher.calls(), 1);

        resolver.resolve("https://auth.example/b").await.unwrap();
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(resolver.cache().len().await, 2);
    }

    #[tokio::test]
    async fn test_resolver_failure_is_not_cached() {
        let fetcher = CountingFetcher::new(vec![
            Err(SessionError::KeyFetch("key set endpoint returned 500".to_string())),
            Ok(listing(&["k1"])),
        ]);
        let resolver = KeySetResolver::new(KeySetCache::new(), fetcher.clone());

        let err = resolver.resolve("https://auth.example/a").await.unwrap_err();
        assert!(matches!(err, SessionError::KeyFetch(_)));
        assert!(resolver.cache().is_empty().await);

        resolver.resolve("https://auth.example/a").await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }
}
