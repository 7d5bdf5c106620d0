//! Session lifecycle core: signed session tokens verified against a rotating
//! remote key set, kept alive by a scheduled refresh protocol.
//!
//! # Components
//!
//! - [`jwks`] - key-set fetching and the process-wide key-set cache
//! - [`verifier`] - token verification and claim-to-session mapping
//! - [`retry`] - generic retry-with-restart resolver
//! - [`controller`] - client-side session state machine
//! - [`server`] - server-side session helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use session_core::config::SessionConfig;
//! use session_core::server::ServerAuth;
//!
//! let config = SessionConfig::from_env()?;
//! let auth = ServerAuth::from_config(&config)?;
//! let session = auth.verify_token(token).await?;
//! println!("signed in as {}", session.user.id);
//! ```

#![warn(clippy::pedantic)]

/// Module for configuration loaded from the environment
pub mod config;

/// Module for error types
pub mod error;

/// Module for session and context data types
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for JWT header inspection and session claims
pub mod jwt;

/// Module for API credential resolution
pub mod credentials;

/// Module for remote key-set fetching and caching
pub mod jwks;

/// Module for token verification
pub mod verifier;

/// Module for verification context resolution
pub mod context;

/// Module for retry-with-restart resolution
pub mod retry;

/// Module for external collaborators (token store, location, clock)
pub mod env;

/// Module for the session refresh endpoint client
pub mod refresh;

/// Module for the client-side session controller
pub mod controller;

/// Module for server-side session helpers
pub mod server;

pub use error::{InvalidTokenError, KeyFailure, SessionError};
pub use types::{Session, SessionUser, VerificationContext};
