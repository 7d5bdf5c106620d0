//! External collaborators of the session controller.
//!
//! The controller never touches cookies, the address bar or the system clock
//! directly; it goes through these traits. In-memory implementations are
//! provided for embedding and tests.

use crate::secret::SecretString;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Fragment prefix carrying a one-time session token.
pub const SESSION_TOKEN_FRAGMENT_PREFIX: &str = "#sessionToken=";

/// Persisted token storage (a cookie jar in browser deployments).
///
/// Writes replace the whole value; last write wins.
pub trait TokenStore: Send + Sync {
    /// Token stored under `name`, if any.
    fn get(&self, name: &str) -> Option<SecretString>;

    /// Store `token` under `name`, replacing any previous value.
    fn set(&self, name: &str, token: SecretString);

    /// Remove the token stored under `name`.
    fn delete(&self, name: &str);
}

/// In-memory [`TokenStore`].
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, SecretString>>,
    writes: Mutex<usize>,
}

impl fmt::Debug for MemoryTokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("MemoryTokenStore")
            .field("names", &tokens.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl MemoryTokenStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set` and `delete` calls so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_write(&self) {
        *self.writes.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, name: &str) -> Option<SecretString> {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn set(&self, name: &str, token: SecretString) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), token);
        self.record_write();
    }

    fn delete(&self, name: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        self.record_write();
    }
}

/// The client's current address.
pub trait Location: Send + Sync {
    /// Current fragment including the leading `#`, if any.
    fn fragment(&self) -> Option<String>;

    /// Remove the fragment from the address without navigating.
    fn strip_fragment(&self);

    /// Navigate away to `url`.
    fn navigate(&self, url: &str);
}

#[derive(Debug, Default)]
struct LocationState {
    fragment: Option<String>,
    strips: usize,
    navigations: Vec<String>,
}

/// In-memory [`Location`] recording navigations.
#[derive(Debug, Default)]
pub struct MemoryLocation {
    state: Mutex<LocationState>,
}

impl MemoryLocation {
    /// Create a location without a fragment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a location with `fragment` (including the leading `#`).
    #[must_use]
    pub fn with_fragment(fragment: &str) -> Self {
        let location = Self::default();
        location.set_fragment(fragment);
        location
    }

    /// Replace the fragment, as a history navigation would.
    pub fn set_fragment(&self, fragment: &str) {
        self.lock().fragment = Some(fragment.to_string());
    }

    /// Number of times the fragment was stripped.
    #[must_use]
    pub fn strip_count(&self) -> usize {
        self.lock().strips
    }

    /// URLs navigated to, in order.
    #[must_use]
    pub fn navigations(&self) -> Vec<String> {
        self.lock().navigations.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Location for MemoryLocation {
    fn fragment(&self) -> Option<String> {
        self.lock().fragment.clone()
    }

    fn strip_fragment(&self) {
        let mut state = self.lock();
        state.fragment = None;
        state.strips += 1;
    }

    fn navigate(&self, url: &str) {
        self.lock().navigations.push(url.to_string());
    }
}

/// Extract the one-time token from a `#sessionToken=<token>` fragment.
#[must_use]
pub fn parse_fragment_token(fragment: &str) -> Option<SecretString> {
    fragment
        .strip_prefix(SESSION_TOKEN_FRAGMENT_PREFIX)
        .filter(|token| !token.is_empty())
        .map(SecretString::from)
}

/// Wall-clock source.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// [`Clock`] backed by the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::secret::ExposeSecret;

    #[test]
    fn test_parse_fragment_token() {
        let token = parse_fragment_token("#sessionToken=abc.def.ghi").unwrap();
        assert_eq!(token.expose_secret(), "abc.def.ghi");

        assert!(parse_fragment_token("#sessionToken=").is_none());
        assert!(parse_fragment_token("#other=abc").is_none());
        assert!(parse_fragment_token("sessionToken=abc").is_none());
        assert!(parse_fragment_token("").is_none());
    }

    #[test]
    fn test_memory_token_store() {
        let store = MemoryTokenStore::new();
        assert!(store.get("session_e1").is_none());

        store.set("session_e1", SecretString::from("t1"));
        store.set("session_e1", SecretString::from("t2"));
        assert_eq!(store.get("session_e1").unwrap().expose_secret(), "t2");

        store.delete("session_e1");
        assert!(store.get("session_e1").is_none());
        assert_eq!(store.write_count(), 3);
    }

    #[test]
    fn test_memory_token_store_debug_hides_tokens() {
        let store = MemoryTokenStore::new();
        store.set("session_e1", SecretString::from("very-secret"));

        let debug_str = format!("{store:?}");
        assert!(debug_str.contains("session_e1"));
        assert!(!debug_str.contains("very-secret"));
    }

    #[test]
    fn test_memory_location() {
        let location = MemoryLocation::with_fragment("#sessionToken=abc");
        assert_eq!(location.fragment().as_deref(), Some("#sessionToken=abc"));

        location.strip_fragment();
        assert!(location.fragment().is_none());
        assert_eq!(location.strip_count(), 1);

        location.navigate("https://auth.example/e1/signin");
        assert_eq!(location.navigations(), vec!["https://auth.example/e1/signin"]);
    }
}
