//! Retry-with-restart resolution of asynchronously produced values.
//!
//! A [`RetryingResolver`] drives a producer until it succeeds or the attempt
//! budget is spent, publishing progress as [`RetryState`] through a watch
//! channel. Each run is a "cycle"; [`RetryingResolver::restart`] abandons the
//! current cycle and starts a fresh one from attempt zero.
//!
//! Backoff between attempts is exponential with optional jitter:
//! `min(max_delay, min_delay * factor^retry * jitter)` where `jitter` is drawn
//! from `[1, 2)` when `randomize` is set.
//!
//! Closing the resolver (or dropping it) cancels the current cycle. The
//! producer is handed a `CancellationToken` it may observe; once cancelled, no
//! further attempts start and no further state is published.

use crate::error::{Result, SessionError};
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Default number of attempts (the first try plus 10 retries).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 11;

/// Default backoff growth factor.
pub const DEFAULT_FACTOR: f64 = 2.0;

/// Default delay before the first retry.
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_secs(1);

/// Default cap on the delay between attempts.
///
/// The usual retry-library defaults leave the delay uncapped. This cap is a
/// deliberate departure: late retries wait 30s instead of several minutes.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Callback invoked after each failed attempt that will be retried, with the
/// error and the 1-based number of the failed attempt.
pub type RetryObserver = Arc<dyn Fn(&SessionError, u32) + Send + Sync>;

/// Retry configuration.
///
/// Compared by value; the observer is compared by pointer identity.
#[derive(Clone)]
pub struct RetryOptions {
    /// Total attempts per cycle, including the first. Values below 1 count as 1.
    pub max_attempts: u32,

    /// Backoff growth factor.
    pub factor: f64,

    /// Delay before the first retry.
    pub min_delay: Duration,

    /// Cap on the delay between attempts.
    pub max_delay: Duration,

    /// Multiply each delay by a random factor in `[1, 2)`.
    pub randomize: bool,

    /// Optional retry observer.
    pub on_retry: Option<RetryObserver>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            factor: DEFAULT_FACTOR,
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            randomize: true,
            on_retry: None,
        }
    }
}

impl PartialEq for RetryOptions {
    fn eq(&self, other: &Self) -> bool {
        let same_observer = match (&self.on_retry, &other.on_retry) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };

        self.max_attempts == other.max_attempts
            && self.factor.to_bits() == other.factor.to_bits()
            && self.min_delay == other.min_delay
            && self.max_delay == other.max_delay
            && self.randomize == other.randomize
            && same_observer
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_attempts", &self.max_attempts)
            .field("factor", &self.factor)
            .field("min_delay", &self.min_delay)
            .field("max_delay", &self.max_delay)
            .field("randomize", &self.randomize)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl RetryOptions {
    /// Set the attempt budget.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the delay bounds.
    #[must_use]
    pub fn with_delays(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self.max_delay = max_delay;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn with_randomize(mut self, randomize: bool) -> Self {
        self.randomize = randomize;
        self
    }

    /// Install a retry observer.
    #[must_use]
    pub fn with_observer(mut self, observer: RetryObserver) -> Self {
        self.on_retry = Some(observer);
        self
    }

    /// Delay before retry number `retry` (0-based).
    #[must_use]
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let jitter = if self.randomize {
            rand::thread_rng().gen_range(1.0..2.0)
        } else {
            1.0
        };
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.min_delay.as_secs_f64() * self.factor.powi(exponent) * jitter;

        Duration::try_from_secs_f64(secs)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    fn attempt_budget(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Observable state of a retry cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryState<T> {
    /// The cycle is still running.
    Pending,

    /// The producer succeeded.
    Success(T),

    /// Every attempt failed; holds the last error.
    Failure(SessionError),
}

impl<T> RetryState<T> {
    /// Whether the cycle is still running.
    pub fn is_pending(&self) -> bool {
        matches!(self, RetryState::Pending)
    }

    /// The produced value, if the cycle succeeded.
    pub fn success(&self) -> Option<&T> {
        match self {
            RetryState::Success(value) => Some(value),
            _ => None,
        }
    }
}

type Producer<T> = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<T>> + Send + Sync>;

struct Cycle {
    generation: u64,
    cancel: CancellationToken,
    options: RetryOptions,
}

struct Shared<T> {
    state_tx: watch::Sender<RetryState<T>>,
    root: CancellationToken,
    cycle: Mutex<Cycle>,
}

impl<T> Shared<T> {
    /// Publish `state` only if `generation` is still the live cycle.
    fn publish(&self, generation: u64, state: RetryState<T>) -> bool {
        let cycle = self.cycle.lock().unwrap_or_else(PoisonError::into_inner);
        if cycle.generation != generation || cycle.cancel.is_cancelled() {
            return false;
        }
        self.state_tx.send_replace(state);
        true
    }
}

/// Drives a producer with bounded retries and restart support.
///
/// Must be created inside a tokio runtime.
pub struct RetryingResolver<T> {
    producer: Producer<T>,
    shared: Arc<Shared<T>>,
}

impl<T> fmt::Debug for RetryingResolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cycle = self
            .shared
            .cycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("RetryingResolver")
            .field("generation", &cycle.generation)
            .field("options", &cycle.options)
            .field("closed", &self.shared.root.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<T> RetryingResolver<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Start resolving with `producer` under `options`.
    pub fn spawn<F, Fut>(producer: F, options: RetryOptions) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let producer: Producer<T> = Arc::new(move |cancel| producer(cancel).boxed());
        let root = CancellationToken::new();
        let (state_tx, _) = watch::channel(RetryState::Pending);

        let shared = Arc::new(Shared {
            state_tx,
            cycle: Mutex::new(Cycle {
                generation: 0,
                cancel: root.child_token(),
                options,
            }),
            root,
        });

        let resolver = Self { producer, shared };
        resolver.start_cycle(None);
        resolver
    }

    /// Current state of the live cycle.
    pub fn state(&self) -> RetryState<T> {
        self.shared.state_tx.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<RetryState<T>> {
        self.shared.state_tx.subscribe()
    }

    /// Options of the live cycle.
    pub fn options(&self) -> RetryOptions {
        self.shared
            .cycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .options
            .clone()
    }

    /// Abandon the current cycle and start a fresh one from attempt zero.
    ///
    /// No-op once closed.
    pub fn restart(&self) {
        self.start_cycle(None);
    }

    /// Replace the options, restarting only if they differ from the current
    /// ones. Returns whether a restart happened.
    pub fn set_options(&self, options: RetryOptions) -> bool {
        {
            let cycle = self
                .shared
                .cycle
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if cycle.options == options {
                return false;
            }
        }
        self.start_cycle(Some(options))
    }

    /// Wait for the first terminal state of the live cycle.
    ///
    /// # Errors
    ///
    /// Returns the cycle's failure, or `SessionError::Closed` if the resolver
    /// is closed first.
    pub async fn wait(&self) -> Result<T> {
        let mut rx = self.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            match current {
                RetryState::Success(value) => return Ok(value),
                RetryState::Failure(err) => return Err(err),
                RetryState::Pending => {}
            }

            tokio::select! {
                () = self.shared.root.cancelled() => return Err(SessionError::Closed),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(SessionError::Closed);
                    }
                }
            }
        }
    }

    /// Cancel the live cycle. No further state is published.
    pub fn close(&self) {
        if !self.shared.root.is_cancelled() {
            tracing::debug!(target: "session.retry", "Retrying resolver closed");
        }
        self.shared.root.cancel();
    }

    /// Whether the resolver has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.root.is_cancelled()
    }

    fn start_cycle(&self, options: Option<RetryOptions>) -> bool {
        let (generation, cancel, options) = {
            let mut cycle = self
                .shared
                .cycle
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.shared.root.is_cancelled() {
                return false;
            }

            cycle.cancel.cancel();
            cycle.generation += 1;
            cycle.cancel = self.shared.root.child_token();
            if let Some(options) = options {
                cycle.options = options;
            }
            self.shared.state_tx.send_replace(RetryState::Pending);

            (cycle.generation, cycle.cancel.clone(), cycle.options.clone())
        };

        tracing::debug!(target: "session.retry", generation, "Starting retry cycle");
        tokio::spawn(run_cycle(
            Arc::clone(&self.shared),
            Arc::clone(&self.producer),
            generation,
            cancel,
            options,
        ));
        true
    }
}

impl<T> Drop for RetryingResolver<T> {
    fn drop(&mut self) {
        self.shared.root.cancel();
    }
}

async fn run_cycle<T>(
    shared: Arc<Shared<T>>,
    producer: Producer<T>,
    generation: u64,
    cancel: CancellationToken,
    options: RetryOptions,
) {
    let budget = options.attempt_budget();

    for attempt in 1..=budget {
        if cancel.is_cancelled() {
            return;
        }

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            result = producer(cancel.clone()) => result,
        };

        let err = match result {
            Ok(value) => {
                if shared.publish(generation, RetryState::Success(value)) {
                    tracing::debug!(target: "session.retry", generation, attempt, "Retry cycle succeeded");
                }
                return;
            }
            Err(err) => err,
        };

        if cancel.is_cancelled() {
            return;
        }

        if attempt >= budget {
            tracing::warn!(
                target: "session.retry",
                generation,
                attempts = attempt,
                error = %err,
                "Retry cycle exhausted"
            );
            shared.publish(generation, RetryState::Failure(err));
            return;
        }

        if let Some(observer) = &options.on_retry {
            observer(&err, attempt);
        }

        let delay = options.backoff_delay(attempt - 1);
        tracing::debug!(
            target: "session.retry",
            generation,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Attempt failed, retrying"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fixed_options(max_attempts: u32) -> RetryOptions {
        RetryOptions::default()
            .with_max_attempts(max_attempts)
            .with_randomize(false)
    }

    /// Producer failing `failures` times before succeeding with the attempt count.
    fn flaky(
        failures: u32,
        calls: Arc<AtomicU32>,
    ) -> impl Fn(CancellationToken) -> BoxFuture<'static, Result<u32>> + Send + Sync + 'static {
        move |_cancel| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    Err(SessionError::KeyFetch(format!("attempt {n} failed")))
                } else {
                    Ok(n)
                }
            }
            .boxed()
        }
    }

    #[test]
    fn test_backoff_delay_without_jitter() {
        let options = fixed_options(11);

        assert_eq!(options.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(options.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(options.backoff_delay(4), Duration::from_secs(16));
        assert_eq!(options.backoff_delay(5), Duration::from_secs(30));
        assert_eq!(options.backoff_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_delay_with_jitter_stays_in_range() {
        let options = RetryOptions::default();
        for _ in 0..100 {
            let delay = options.backoff_delay(1);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay < Duration::from_secs(4));
        }
    }

    #[test]
    fn test_default_delay_is_capped() {
        let options = RetryOptions::default();
        let last_retry = DEFAULT_MAX_ATTEMPTS - 2;

        for _ in 0..100 {
            assert_eq!(options.backoff_delay(last_retry), DEFAULT_MAX_DELAY);
        }
    }

    #[test]
    fn test_options_equality() {
        let observer: RetryObserver = Arc::new(|_, _| {});

        assert_eq!(RetryOptions::default(), RetryOptions::default());
        assert_ne!(RetryOptions::default(), fixed_options(11));

        let a = RetryOptions::default().with_observer(Arc::clone(&observer));
        let b = RetryOptions::default().with_observer(Arc::clone(&observer));
        let c = RetryOptions::default().with_observer(Arc::new(|_, _| {}));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let resolver = RetryingResolver::spawn(flaky(3, Arc::clone(&calls)), fixed_options(4));

        assert_eq!(resolver.wait().await.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(resolver.state(), RetryState::Success(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_exactly_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let resolver = RetryingResolver::spawn(flaky(u32::MAX, Arc::clone(&calls)), fixed_options(3));

        let err = resolver.wait().await.unwrap_err();

        assert_eq!(err, SessionError::KeyFetch("attempt 3 failed".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // No further attempts after the terminal state.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_each_retry() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let observer: RetryObserver = Arc::new(move |_err, attempt| {
            seen_clone.lock().unwrap().push(attempt);
        });

        let calls = Arc::new(AtomicU32::new(0));
        let resolver = RetryingResolver::spawn(
            flaky(2, Arc::clone(&calls)),
            fixed_options(5).with_observer(observer),
        );

        resolver.wait().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_begins_from_attempt_zero() {
        let calls = Arc::new(AtomicU32::new(0));
        let resolver = RetryingResolver::spawn(flaky(u32::MAX, Arc::clone(&calls)), fixed_options(2));

        assert!(resolver.wait().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        resolver.restart();
        assert!(resolver.state().is_pending());

        assert!(resolver.wait().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_attempts_and_transitions() {
        let calls = Arc::new(AtomicU32::new(0));
        let resolver = RetryingResolver::spawn(flaky(u32::MAX, Arc::clone(&calls)), fixed_options(11));
        let mut rx = resolver.subscribe();

        // Let the first attempt fail and the first backoff start.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        resolver.close();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!rx.has_changed().unwrap());
        assert!(resolver.state().is_pending());
        assert_eq!(resolver.wait().await.unwrap_err(), SessionError::Closed);

        resolver.restart();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_result_after_close_is_discarded() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let gate_clone = Arc::clone(&gate);
        let resolver = RetryingResolver::spawn(
            move |_cancel| {
                let gate = Arc::clone(&gate_clone);
                async move {
                    gate.notified().await;
                    Ok::<_, SessionError>(7u32)
                }
            },
            fixed_options(1),
        );

        tokio::time::sleep(Duration::from_millis(1)).await;
        resolver.close();
        gate.notify_waiters();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(resolver.state().is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_sees_cancellation() {
        let observed = Arc::new(AtomicU32::new(0));
        let observed_clone = Arc::clone(&observed);
        let resolver = RetryingResolver::spawn(
            move |cancel: CancellationToken| {
                let observed = Arc::clone(&observed_clone);
                async move {
                    tokio::spawn(async move {
                        cancel.cancelled().await;
                        observed.fetch_add(1, Ordering::SeqCst);
                    });
                    futures::future::pending::<Result<u32>>().await
                }
            },
            fixed_options(1),
        );

        tokio::time::sleep(Duration::from_millis(1)).await;
        drop(resolver);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_options_restarts_only_on_change() {
        let calls = Arc::new(AtomicU32::new(0));
        let resolver = RetryingResolver::spawn(flaky(0, Arc::clone(&calls)), fixed_options(3));
        resolver.wait().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(!resolver.set_options(fixed_options(3)));
        assert!(!resolver.state().is_pending());

        assert!(resolver.set_options(fixed_options(5)));
        assert_eq!(resolver.wait().await.unwrap(), 2);
        assert_eq!(resolver.options().max_attempts, 5);
    }
}
