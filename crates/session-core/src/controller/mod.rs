//! Client-side session controller.
//!
//! [`SessionController`] is the handle; the state machine runs in a spawned
//! actor task that is the single writer of [`ControllerState`]:
//!
//! ```text
//! Bootstrapping -> Unauthenticated <-> Authenticated -> Refreshing
//!                                                        |-> Authenticated
//!                                                        `-> Unauthenticated
//! ```
//!
//! Closing the handle (or dropping it) cancels the bootstrap resolver, the
//! refresh timer and any in-flight refresh. No state is published afterwards.

mod actor;
mod messages;

pub use messages::{ControllerState, SignInOutcome};

use crate::env::{Clock, Location, TokenStore};
use crate::error::{Result, SessionError};
use crate::refresh::{RefreshPolicy, SessionRefresher};
use crate::retry::{RetryOptions, RetryState, RetryingResolver};
use crate::types::{Session, VerificationContext};
use actor::SessionControllerActor;
use messages::ControllerCommand;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Default channel buffer size for the controller mailbox.
const CONTROLLER_CHANNEL_BUFFER: usize = 64;

/// External collaborators of the controller.
#[derive(Clone)]
pub struct ControllerEnv {
    /// Persisted token storage.
    pub store: Arc<dyn TokenStore>,

    /// The client's address.
    pub location: Arc<dyn Location>,

    /// Refresh endpoint client.
    pub refresher: Arc<dyn SessionRefresher>,

    /// Wall-clock source.
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for ControllerEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerEnv").finish_non_exhaustive()
    }
}

/// Controller tuning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerConfig {
    /// Retry options for verification context resolution.
    pub bootstrap: RetryOptions,

    /// Backoff policy of refresh chains.
    pub refresh: RefreshPolicy,
}

/// Handle to the session controller actor.
pub struct SessionController {
    sender: mpsc::Sender<ControllerCommand>,
    state_rx: watch::Receiver<ControllerState>,
    bootstrap: RetryingResolver<Arc<VerificationContext>>,
    cancel_token: CancellationToken,
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &*self.state_rx.borrow())
            .field("closed", &self.cancel_token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// Spawn the controller. `producer` resolves the verification context and
    /// is retried under `config.bootstrap`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn<F, Fut>(producer: F, env: ControllerEnv, config: ControllerConfig) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<VerificationContext>>> + Send + 'static,
    {
        let bootstrap = RetryingResolver::spawn(producer, config.bootstrap);
        let (sender, receiver) = mpsc::channel(CONTROLLER_CHANNEL_BUFFER);
        let (state_tx, state_rx) = watch::channel(ControllerState::Bootstrapping);
        let cancel_token = CancellationToken::new();

        let actor = SessionControllerActor::new(
            receiver,
            bootstrap.subscribe(),
            state_tx,
            env,
            config.refresh,
            cancel_token.clone(),
        );
        tokio::spawn(actor.run());

        Self {
            sender,
            state_rx,
            bootstrap,
            cancel_token,
        }
    }

    /// Current controller state.
    #[must_use]
    pub fn state(&self) -> ControllerState {
        self.state_rx.borrow().clone()
    }

    /// Subscribe to controller state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.state_rx.clone()
    }

    /// The live session, if any.
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.state_rx.borrow().session().cloned()
    }

    /// Start the sign-in flow.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotReady` before the context is resolved, or
    /// `SessionError::Closed` after [`close`](Self::close).
    pub async fn sign_in(&self) -> Result<SignInOutcome> {
        self.request(|respond_to| ControllerCommand::SignIn { respond_to })
            .await
    }

    /// End the live session and delete the persisted token.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotReady` before the context is resolved, or
    /// `SessionError::Closed` after [`close`](Self::close).
    pub async fn sign_out(&self) -> Result<()> {
        self.request(|respond_to| ControllerCommand::SignOut { respond_to })
            .await
    }

    /// Re-read the address fragment after a history navigation.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotReady` before the context is resolved, or
    /// `SessionError::Closed` after [`close`](Self::close).
    pub async fn location_changed(&self) -> Result<()> {
        self.request(|respond_to| ControllerCommand::LocationChanged { respond_to })
            .await
    }

    /// State of the verification context resolution.
    #[must_use]
    pub fn bootstrap_state(&self) -> RetryState<Arc<VerificationContext>> {
        self.bootstrap.state()
    }

    /// Restart verification context resolution from attempt zero.
    pub fn restart_bootstrap(&self) {
        self.bootstrap.restart();
    }

    /// Tear the controller down.
    pub fn close(&self) {
        self.bootstrap.close();
        self.cancel_token.cancel();
    }

    /// Whether the controller has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<R>>) -> ControllerCommand,
    ) -> Result<R> {
        if self.cancel_token.is_cancelled() {
            return Err(SessionError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        self.sender
            .send(command(tx))
            .await
            .map_err(|_| SessionError::Closed)?;

        rx.await.map_err(|_| SessionError::Closed)?
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
