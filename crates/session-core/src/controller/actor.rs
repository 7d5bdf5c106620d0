//! `SessionControllerActor` - single writer of the controller state.
//!
//! The actor waits for the verification context, loads the session token
//! (one-time fragment first, then the token store) and drives the session
//! lifecycle:
//!
//! - a verified token becomes the live session and arms the refresh timer
//! - the timer starts a refresh chain, or ends the session if it expired
//! - a refreshed token is persisted and re-verified
//!
//! Each adopted token starts a new generation with its own child
//! `CancellationToken`. Starting a generation cancels the previous one, and
//! events from any other generation are dropped.

use super::messages::{ControllerCommand, ControllerState, SessionEvent, SignInOutcome};
use super::ControllerEnv;
use crate::env::parse_fragment_token;
use crate::error::{Result, SessionError};
use crate::refresh::{refresh_until_expiry, RefreshOutcome, RefreshPolicy};
use crate::retry::RetryState;
use crate::secret::{ExposeSecret, SecretString};
use crate::types::{Session, VerificationContext};
use crate::verifier::verify_token_at;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub(crate) struct SessionControllerActor {
    /// Consumer requests.
    commands: mpsc::Receiver<ControllerCommand>,
    /// Sender cloned into spawned work.
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    /// Results of spawned work.
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    /// Bootstrap resolver state.
    context_rx: watch::Receiver<RetryState<Arc<VerificationContext>>>,
    /// Resolved verification context.
    context: Option<Arc<VerificationContext>>,
    /// Published controller state.
    state_tx: watch::Sender<ControllerState>,
    env: ControllerEnv,
    policy: RefreshPolicy,
    /// Root cancellation token.
    cancel_token: CancellationToken,
    /// Current session generation.
    generation: u64,
    /// Cancellation token of the current generation.
    session_cancel: Option<CancellationToken>,
    /// Token of the current generation.
    session_token: Option<SecretString>,
    /// Live session.
    session: Option<Session>,
}

impl SessionControllerActor {
    pub(crate) fn new(
        commands: mpsc::Receiver<ControllerCommand>,
        context_rx: watch::Receiver<RetryState<Arc<VerificationContext>>>,
        state_tx: watch::Sender<ControllerState>,
        env: ControllerEnv,
        policy: RefreshPolicy,
        cancel_token: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            commands,
            events_tx,
            events_rx,
            context_rx,
            context: None,
            state_tx,
            env,
            policy,
            cancel_token,
            generation: 0,
            session_cancel: None,
            session_token: None,
            session: None,
        }
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "session.controller")]
    pub(crate) async fn run(mut self) {
        debug!(target: "session.controller", "SessionControllerActor started");

        // The context may have resolved before the actor was first polled.
        let initial = self.context_rx.borrow_and_update().clone();
        self.on_bootstrap_state(initial);

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    debug!(target: "session.controller", "SessionControllerActor received cancellation signal");
                    break;
                }

                changed = self.context_rx.changed(), if self.context.is_none() => {
                    if changed.is_err() {
                        debug!(target: "session.controller", "Bootstrap resolver dropped, exiting");
                        break;
                    }
                    let state = self.context_rx.borrow_and_update().clone();
                    self.on_bootstrap_state(state);
                }

                msg = self.commands.recv() => {
                    match msg {
                        Some(command) => self.handle_command(command),
                        None => {
                            debug!(target: "session.controller", "Command channel closed, exiting");
                            break;
                        }
                    }
                }

                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event);
                }
            }
        }

        if let Some(cancel) = self.session_cancel.take() {
            cancel.cancel();
        }
        debug!(
            target: "session.controller",
            generation = self.generation,
            "SessionControllerActor stopped"
        );
    }

    fn on_bootstrap_state(&mut self, state: RetryState<Arc<VerificationContext>>) {
        match state {
            RetryState::Pending => {}
            RetryState::Failure(e) => {
                warn!(
                    target: "session.controller",
                    error = %e,
                    "Verification context resolution failed"
                );
            }
            RetryState::Success(context) => {
                info!(
                    target: "session.controller",
                    environment_id = %context.environment_id,
                    "Verification context ready"
                );
                self.context = Some(context);
                self.observe_token_sources();
            }
        }
    }

    fn handle_command(&mut self, command: ControllerCommand) {
        match command {
            ControllerCommand::SignIn { respond_to } => {
                let _ = respond_to.send(self.sign_in());
            }
            ControllerCommand::SignOut { respond_to } => {
                let result = if self.context.is_some() {
                    self.end_session("signed out");
                    Ok(())
                } else {
                    Err(SessionError::NotReady)
                };
                let _ = respond_to.send(result);
            }
            ControllerCommand::LocationChanged { respond_to } => {
                let result = if self.context.is_some() {
                    self.observe_token_sources();
                    Ok(())
                } else {
                    Err(SessionError::NotReady)
                };
                let _ = respond_to.send(result);
            }
        }
    }

    fn sign_in(&self) -> Result<SignInOutcome> {
        let context = self.context.as_ref().ok_or_else(|| {
            warn!(target: "session.controller", "Sign-in requested before context is ready");
            SessionError::NotReady
        })?;

        if let Some(hook) = &context.sign_in_hook {
            hook.sign_in(context);
            return Ok(SignInOutcome::Delegated);
        }

        let url = context.sign_in_url();
        self.env.location.navigate(&url);
        Ok(SignInOutcome::Navigated(url))
    }

    /// Adopt a token from the fragment, or from the store if none is held.
    fn observe_token_sources(&mut self) {
        let Some(context) = self.context.clone() else {
            return;
        };
        let name = context.session_cookie_name();

        if let Some(token) = self
            .env
            .location
            .fragment()
            .and_then(|fragment| parse_fragment_token(&fragment))
        {
            debug!(target: "session.controller", "Session token taken from fragment");
            self.env.store.set(&name, token.clone());
            self.env.location.strip_fragment();
            self.adopt_token(token);
            return;
        }

        if self.session_token.is_none() {
            if let Some(token) = self.env.store.get(&name) {
                debug!(target: "session.controller", "Session token taken from store");
                self.adopt_token(token);
                return;
            }
        }

        if self.session_token.is_none() {
            self.set_state(ControllerState::Unauthenticated);
        }
    }

    /// Start a new generation for `token` and verify it.
    fn adopt_token(&mut self, token: SecretString) {
        let Some(context) = self.context.clone() else {
            return;
        };

        let cancel = self.start_generation();
        self.session_token = Some(token.clone());

        let generation = self.generation;
        let events = self.events_tx.clone();
        let now = self.env.clock.now();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                result = verify_token_at(&context, token.expose_secret(), now) => result,
            };
            let _ = events.send(SessionEvent::Verified { generation, result });
        });
    }

    /// Cancel the current generation and open the next one.
    fn start_generation(&mut self) -> CancellationToken {
        if let Some(previous) = self.session_cancel.take() {
            previous.cancel();
        }
        self.generation += 1;
        let cancel = self.cancel_token.child_token();
        self.session_cancel = Some(cancel.clone());
        cancel
    }

    fn handle_event(&mut self, event: SessionEvent) {
        if event.generation() != self.generation {
            debug!(
                target: "session.controller",
                event_generation = event.generation(),
                generation = self.generation,
                "Discarding event from superseded session"
            );
            return;
        }

        match event {
            SessionEvent::Verified { result, .. } => self.on_verified(result),
            SessionEvent::RefreshDue { .. } => self.on_refresh_due(),
            SessionEvent::Refreshed { token, .. } => self.on_refreshed(token),
            SessionEvent::RefreshExhausted { .. } => self.on_refresh_exhausted(),
            SessionEvent::Expired { .. } => self.end_session("session expired"),
        }
    }

    fn on_verified(&mut self, result: Result<Session>) {
        match result {
            Ok(session) => {
                info!(
                    target: "session.controller",
                    generation = self.generation,
                    refresh_at = %session.refresh_at,
                    expires = %session.expires,
                    "Session verified"
                );
                let delay = self.until(session.refresh_at);
                self.session = Some(session.clone());
                self.set_state(ControllerState::Authenticated(session));
                self.arm_timer(delay, SessionEvent::RefreshDue {
                    generation: self.generation,
                });
            }
            Err(e) => {
                warn!(target: "session.controller", error = %e, "Session token rejected");
                self.end_session("invalid token");
            }
        }
    }

    fn on_refresh_due(&mut self) {
        let (Some(session), Some(token), Some(context), Some(cancel)) = (
            self.session.clone(),
            self.session_token.clone(),
            self.context.clone(),
            self.session_cancel.clone(),
        ) else {
            return;
        };

        if session.is_expired_at(self.env.clock.now()) {
            self.end_session("session expired");
            return;
        }

        debug!(target: "session.controller", generation = self.generation, "Refreshing session");
        self.set_state(ControllerState::Refreshing(session.clone()));

        let generation = self.generation;
        let events = self.events_tx.clone();
        let refresher = Arc::clone(&self.env.refresher);
        let clock = Arc::clone(&self.env.clock);
        let policy = self.policy.clone();
        tokio::spawn(async move {
            let outcome = refresh_until_expiry(
                refresher.as_ref(),
                &context.base_url,
                &token,
                &session,
                clock.as_ref(),
                &policy,
                &cancel,
            )
            .await;

            let event = match outcome {
                RefreshOutcome::Refreshed(token) => SessionEvent::Refreshed { generation, token },
                RefreshOutcome::Expired => SessionEvent::Expired { generation },
                RefreshOutcome::Exhausted => SessionEvent::RefreshExhausted { generation },
                RefreshOutcome::Cancelled => return,
            };
            let _ = events.send(event);
        });
    }

    fn on_refreshed(&mut self, token: SecretString) {
        let Some(context) = self.context.clone() else {
            return;
        };
        self.env.store.set(&context.session_cookie_name(), token.clone());
        self.adopt_token(token);
    }

    fn on_refresh_exhausted(&mut self) {
        let Some(session) = self.session.clone() else {
            return;
        };
        warn!(
            target: "session.controller",
            expires = %session.expires,
            "Session refresh abandoned, session ends at expiry"
        );
        let delay = self.until(session.expires);
        self.set_state(ControllerState::Authenticated(session));
        self.arm_timer(delay, SessionEvent::Expired {
            generation: self.generation,
        });
    }

    /// Send `event` after `delay` unless the current generation is cancelled.
    fn arm_timer(&self, delay: Duration, event: SessionEvent) {
        let Some(cancel) = self.session_cancel.clone() else {
            return;
        };
        debug!(
            target: "session.controller",
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Timer armed"
        );

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = events.send(event);
                }
            }
        });
    }

    /// Clear the session, delete the persisted token and cancel its work.
    fn end_session(&mut self, reason: &str) {
        if let Some(cancel) = self.session_cancel.take() {
            cancel.cancel();
        }
        self.generation += 1;
        self.session_token = None;
        self.session = None;

        if let Some(context) = &self.context {
            self.env.store.delete(&context.session_cookie_name());
        }

        info!(target: "session.controller", reason = %reason, "Session ended");
        self.set_state(ControllerState::Unauthenticated);
    }

    fn until(&self, instant: chrono::DateTime<chrono::Utc>) -> Duration {
        (instant - self.env.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    fn set_state(&self, state: ControllerState) {
        if self.cancel_token.is_cancelled() {
            return;
        }
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}
