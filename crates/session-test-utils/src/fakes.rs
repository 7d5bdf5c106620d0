//! In-memory fakes for the session core's network collaborators.

use crate::crypto_fixtures::TestKeypair;
use async_trait::async_trait;
use session_core::credentials::{auth_base_url, CredentialResolver};
use session_core::error::{Result, SessionError};
use session_core::jwks::{jwks_url, Jwk, JwksResponse, KeySetFetcher, KeySetHandle};
use session_core::refresh::SessionRefresher;
use session_core::secret::{ExposeSecret, SecretString};
use session_core::types::{Credentials, VerificationContext};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Key-set fetcher serving a replaceable in-memory listing.
///
/// Fetches can be held open with [`hold`](Self::hold) until
/// [`release`](Self::release) is called.
#[derive(Default)]
pub struct StaticKeySetFetcher {
    keys: Mutex<Vec<Jwk>>,
    failing: Mutex<bool>,
    calls: AtomicUsize,
    held: AtomicBool,
    gate: Notify,
}

impl StaticKeySetFetcher {
    /// Serve the public keys of `keypairs`.
    pub fn new(keypairs: &[&TestKeypair]) -> Self {
        let fetcher = Self::default();
        fetcher.set_keys(keypairs);
        fetcher
    }

    /// Replace the served keys (key rotation).
    pub fn set_keys(&self, keypairs: &[&TestKeypair]) {
        *self.keys.lock().unwrap() = keypairs.iter().map(|kp| kp.jwk()).collect();
    }

    /// Make every fetch fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    /// Block every later fetch until [`release`](Self::release).
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// Let held fetches complete.
    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.gate.notify_waiters();
    }

    /// Number of fetches so far, including held ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySetFetcher for StaticKeySetFetcher {
    async fn fetch(&self, _jwks_url: &str) -> Result<JwksResponse> {
        let released = self.gate.notified();
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.held.load(Ordering::SeqCst) {
            released.await;
        }
        if *self.failing.lock().unwrap() {
            return Err(SessionError::KeyFetch("key set unreachable".to_string()));
        }
        Ok(JwksResponse {
            keys: self.keys.lock().unwrap().clone(),
        })
    }
}

/// Credential resolver mapping every key to one environment.
pub struct StaticCredentialResolver {
    environment_id: String,
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl StaticCredentialResolver {
    /// Resolve every key to `environment_id`.
    pub fn new(environment_id: &str) -> Self {
        Self {
            environment_id: environment_id.to_string(),
            failures_left: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail the first `count` resolutions.
    pub fn failing_first(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    /// Number of resolutions so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, _api_key: &SecretString, base_path: &str) -> Result<Credentials> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SessionError::CredentialResolution(
                "auth service unavailable".to_string(),
            ));
        }
        Ok(Credentials {
            base_url: auth_base_url(base_path, &self.environment_id),
            environment_id: self.environment_id.clone(),
        })
    }
}

/// One scripted refresh response.
#[derive(Debug, Clone)]
pub enum RefreshReply {
    /// Return this token.
    Token(String),
    /// Fail with a transport error.
    Fail,
    /// Never answer; only cancellation ends the call.
    Hang,
}

/// Refresher replaying a queue of [`RefreshReply`] values.
///
/// An exhausted queue answers with transport errors.
#[derive(Default)]
pub struct ScriptedRefresher {
    replies: Mutex<VecDeque<RefreshReply>>,
    presented: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    cancelled: AtomicUsize,
}

impl ScriptedRefresher {
    /// Refresher with the given replies, in order.
    pub fn new(replies: impl IntoIterator<Item = RefreshReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Append a reply.
    pub fn push(&self, reply: RefreshReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// Tokens presented to the refresher, in call order.
    pub fn presented_tokens(&self) -> Vec<String> {
        self.presented.lock().unwrap().clone()
    }

    /// Number of refresh calls so far.
    pub fn calls(&self) -> usize {
        self.presented.lock().unwrap().len()
    }

    /// Number of calls running right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Number of calls that ended because their cancellation token fired.
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Highest number of concurrently running calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionRefresher for ScriptedRefresher {
    async fn refresh(
        &self,
        _base_url: &str,
        token: &SecretString,
        cancel: &CancellationToken,
    ) -> Result<SecretString> {
        self.presented
            .lock()
            .unwrap()
            .push(token.expose_secret().to_string());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let reply = self.replies.lock().unwrap().pop_front();
        let result = match reply {
            Some(RefreshReply::Token(token)) => Ok(SecretString::from(token)),
            Some(RefreshReply::Hang) => {
                cancel.cancelled().await;
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                Err(SessionError::Closed)
            }
            Some(RefreshReply::Fail) | None => Err(SessionError::RefreshTransport(
                "refresh endpoint returned 500".to_string(),
            )),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Verification context for `environment_id` trusting `keypairs`.
///
/// Keys are served by a [`StaticKeySetFetcher`] with a five minute TTL.
pub async fn static_context(
    base_url: &str,
    environment_id: &str,
    keypairs: &[&TestKeypair],
) -> VerificationContext {
    let fetcher = Arc::new(StaticKeySetFetcher::new(keypairs));
    static_context_with_fetcher(base_url, environment_id, fetcher).await
}

/// Verification context backed by `fetcher`.
pub async fn static_context_with_fetcher(
    base_url: &str,
    environment_id: &str,
    fetcher: Arc<StaticKeySetFetcher>,
) -> VerificationContext {
    let key_set = KeySetHandle::load(jwks_url(base_url), fetcher, Duration::from_secs(300))
        .await
        .expect("static key set must load");
    VerificationContext::new(base_url.to_string(), environment_id.to_string(), key_set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_refresher_replays_in_order() {
        let refresher = ScriptedRefresher::new([RefreshReply::Fail, RefreshReply::Token("t2".into())]);
        let cancel = CancellationToken::new();
        let token = SecretString::from("t1");

        assert!(refresher.refresh("b", &token, &cancel).await.is_err());
        let fresh = refresher.refresh("b", &token, &cancel).await.unwrap();
        assert_eq!(fresh.expose_secret(), "t2");
        assert!(refresher.refresh("b", &token, &cancel).await.is_err());

        assert_eq!(refresher.presented_tokens(), vec!["t1", "t1", "t1"]);
        assert_eq!(refresher.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_hanging_reply_ends_on_cancellation() {
        let refresher = Arc::new(ScriptedRefresher::new([RefreshReply::Hang]));
        let cancel = CancellationToken::new();

        let call = tokio::spawn({
            let refresher = Arc::clone(&refresher);
            let cancel = cancel.clone();
            async move {
                refresher
                    .refresh("b", &SecretString::from("t1"), &cancel)
                    .await
            }
        });
        while refresher.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        assert_eq!(call.await.unwrap().unwrap_err(), SessionError::Closed);
        assert_eq!(refresher.in_flight(), 0);
        assert_eq!(refresher.cancelled(), 1);
    }

    #[tokio::test]
    async fn test_held_fetch_waits_for_release() {
        let k1 = TestKeypair::new(1, "k1");
        let fetcher = Arc::new(StaticKeySetFetcher::new(&[&k1]));
        fetcher.hold();

        let fetch = tokio::spawn({
            let fetcher = Arc::clone(&fetcher);
            async move { fetcher.fetch("jwks").await }
        });
        while fetcher.calls() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!fetch.is_finished());

        fetcher.release();
        let response = fetch.await.unwrap().unwrap();
        assert_eq!(response.keys.len(), 1);
    }

    #[tokio::test]
    async fn test_static_credential_resolver_fails_first() {
        let resolver = StaticCredentialResolver::new("e1").failing_first(1);
        let key = SecretString::from("k");

        assert!(resolver.resolve(&key, "https://api.example").await.is_err());
        let credentials = resolver.resolve(&key, "https://api.example").await.unwrap();
        assert_eq!(credentials.base_url, "https://api.example/auth/e1");
        assert_eq!(resolver.calls(), 2);
    }
}
