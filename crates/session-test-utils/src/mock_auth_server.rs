//! Mock authentication service for integration testing
//!
//! Serves the three endpoints the session core talks to: API key details,
//! the JWKS listing and the session refresh endpoint.

use crate::crypto_fixtures::{jwks_json, TestKeypair};
use serde_json::json;
use session_core::credentials::{auth_base_url, API_KEY_HEADER};
use session_core::refresh::SESSION_TOKEN_HEADER;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Mock auth service for one environment.
pub struct MockAuthServer {
    server: MockServer,
    environment_id: String,
}

impl MockAuthServer {
    /// Start a mock server for `environment_id`.
    pub async fn start(environment_id: &str) -> Self {
        Self {
            server: MockServer::start().await,
            environment_id: environment_id.to_string(),
        }
    }

    /// Server root; pass this as the configured base path.
    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Auth base URL for the environment.
    pub fn base_url(&self) -> String {
        auth_base_url(&self.server.uri(), &self.environment_id)
    }

    /// Environment ID.
    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    fn env_path(&self, suffix: &str) -> String {
        format!("/auth/{}{suffix}", self.environment_id)
    }

    /// Accept `api_key` on the API key details endpoint.
    pub async fn mount_api_key_details(&self, api_key: &str) {
        Mock::given(method("GET"))
            .and(path("/auth/apiKeyDetails"))
            .and(header(API_KEY_HEADER, api_key))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "environment_id": self.environment_id })),
            )
            .mount(&self.server)
            .await;
    }

    /// Fail API key details with `status` for the next `times` requests.
    pub async fn mount_api_key_details_failure(&self, status: u16, times: u64) {
        Mock::given(method("GET"))
            .and(path("/auth/apiKeyDetails"))
            .respond_with(ResponseTemplate::new(status))
            .up_to_n_times(times)
            .with_priority(1)
            .mount(&self.server)
            .await;
    }

    /// Publish `keypairs` on the JWKS endpoint.
    pub async fn mount_jwks(&self, keypairs: &[&TestKeypair]) {
        Mock::given(method("GET"))
            .and(path(self.env_path("/.well-known/jwks.json")))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks_json(keypairs)))
            .mount(&self.server)
            .await;
    }

    /// Answer the JWKS endpoint with `status`.
    pub async fn mount_jwks_status(&self, status: u16) {
        Mock::given(method("GET"))
            .and(path(self.env_path("/.well-known/jwks.json")))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// Answer session refresh with `token` in the session token header.
    pub async fn mount_refresh(&self, token: &str) {
        Mock::given(method("POST"))
            .and(path(self.env_path("/session")))
            .respond_with(ResponseTemplate::new(200).insert_header(SESSION_TOKEN_HEADER, token))
            .mount(&self.server)
            .await;
    }

    /// Answer session refresh with `status` and no token.
    pub async fn mount_refresh_status(&self, status: u16) {
        Mock::given(method("POST"))
            .and(path(self.env_path("/session")))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// Number of requests received on `request_path`.
    pub async fn request_count(&self, request_path: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == request_path)
            .count()
    }

    /// Number of JWKS fetches received.
    pub async fn jwks_request_count(&self) -> usize {
        self.request_count(&self.env_path("/.well-known/jwks.json"))
            .await
    }
}
