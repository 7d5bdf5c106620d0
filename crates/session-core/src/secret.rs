//! Secret types for session tokens and API keys.
//!
//! Session tokens and API credentials are bearer secrets: anyone holding one
//! can act as the user or the application. Both are carried as
//! [`SecretString`], whose `Debug` output is redacted, so structs that derive
//! `Debug` or get logged through `tracing` never leak them.
//!
//! ```rust
//! use session_core::secret::{ExposeSecret, SecretString};
//!
//! let token = SecretString::from("header.payload.signature");
//! assert!(!format!("{token:?}").contains("payload"));
//!
//! // Exposing the value is always explicit.
//! let header = format!("Bearer {}", token.expose_secret());
//! assert!(header.starts_with("Bearer "));
//! ```

pub use secrecy::{ExposeSecret, SecretString};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_debug_is_redacted() {
        let token = SecretString::from("eyJhbGciOiJFZERTQSJ9.e30.c2ln");
        let debug_str = format!("{token:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("eyJhbGciOiJFZERTQSJ9"));
    }

    #[test]
    fn test_struct_holding_token_is_safe() {
        #[allow(dead_code)]
        #[derive(Debug)]
        struct RefreshRequest {
            base_url: String,
            token: SecretString,
        }

        let request = RefreshRequest {
            base_url: "https://auth.example/e1".to_string(),
            token: SecretString::from("very-secret-token"),
        };

        let debug_str = format!("{request:?}");
        assert!(debug_str.contains("auth.example"));
        assert!(!debug_str.contains("very-secret-token"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let token = SecretString::from("abc.def.ghi");
        assert_eq!(token.expose_secret(), "abc.def.ghi");
    }
}
