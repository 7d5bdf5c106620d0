//! # Session Test Utilities
//!
//! Shared test utilities for the session core.
//!
//! This crate provides:
//! - Deterministic crypto fixtures (fixed Ed25519 keys for reproducible tests)
//! - Test data builders (`TestTokenBuilder`)
//! - A wiremock auth server (`MockAuthServer`)
//! - In-memory fakes for the key-set fetcher, credential resolver and refresher
//! - A clock that follows tokio's paused time (`TokioClock`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use session_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let keypair = TestKeypair::new(1, "key-1");
//!     let token = TestTokenBuilder::new()
//!         .for_user("alice")
//!         .for_audience("e1")
//!         .sign(&keypair);
//!
//!     let context = static_context("https://auth.example/auth/e1", "e1", &[&keypair]).await;
//!     let session = session_core::verifier::verify_token(&context, &token).await?;
//! }
//! ```

pub mod clock;
pub mod crypto_fixtures;
pub mod fakes;
pub mod mock_auth_server;
pub mod token_builders;

// Re-export commonly used items
pub use clock::*;
pub use crypto_fixtures::*;
pub use fakes::*;
pub use mock_auth_server::*;
pub use token_builders::*;
