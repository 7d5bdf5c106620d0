//! Message types for the session controller.
//!
//! Consumer requests travel on a bounded `tokio::sync::mpsc` channel with
//! `tokio::sync::oneshot` replies. Work spawned by the actor (verification,
//! timers, refresh chains) reports back on an unbounded event channel; every
//! event carries the session generation it was started for so that results
//! of superseded sessions can be discarded.

use crate::error::Result;
use crate::secret::SecretString;
use crate::types::Session;
use tokio::sync::oneshot;

/// Observable controller state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerState {
    /// The verification context is still being resolved.
    Bootstrapping,

    /// No live session.
    Unauthenticated,

    /// A verified session is live.
    Authenticated(Session),

    /// A refresh chain is running for the live session.
    Refreshing(Session),
}

impl ControllerState {
    /// The live session, if any.
    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        match self {
            ControllerState::Authenticated(session) | ControllerState::Refreshing(session) => {
                Some(session)
            }
            ControllerState::Bootstrapping | ControllerState::Unauthenticated => None,
        }
    }
}

/// How a sign-in request was carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInOutcome {
    /// The location was navigated to the sign-in page.
    Navigated(String),

    /// The context's sign-in hook was invoked.
    Delegated,
}

/// Requests from the [`super::SessionController`] handle.
#[derive(Debug)]
pub(crate) enum ControllerCommand {
    /// Start the sign-in flow.
    SignIn {
        /// Response channel for the outcome.
        respond_to: oneshot::Sender<Result<SignInOutcome>>,
    },

    /// End the live session and delete the persisted token.
    SignOut {
        /// Response channel for confirmation.
        respond_to: oneshot::Sender<Result<()>>,
    },

    /// The address changed; re-read the fragment.
    LocationChanged {
        /// Response channel for confirmation.
        respond_to: oneshot::Sender<Result<()>>,
    },
}

/// Results of work spawned by the actor.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// Verification of the generation's token finished.
    Verified {
        generation: u64,
        result: Result<Session>,
    },

    /// The refresh timer fired.
    RefreshDue { generation: u64 },

    /// The refresh chain obtained a new token.
    Refreshed {
        generation: u64,
        token: SecretString,
    },

    /// The refresh chain spent its attempt budget.
    RefreshExhausted { generation: u64 },

    /// The session expired before it could be refreshed.
    Expired { generation: u64 },
}

impl SessionEvent {
    pub(crate) fn generation(&self) -> u64 {
        match self {
            SessionEvent::Verified { generation, .. }
            | SessionEvent::RefreshDue { generation }
            | SessionEvent::Refreshed { generation, .. }
            | SessionEvent::RefreshExhausted { generation }
            | SessionEvent::Expired { generation } => *generation,
        }
    }
}
