//! Verify a session token against the configured auth service.
//!
//! Reads `AUTH_*` configuration from the environment, takes the token from the
//! first argument (or `SESSION_TOKEN`) and prints the verified session as JSON.

use anyhow::{bail, Context};
use session_core::config::SessionConfig;
use session_core::server::ServerAuth;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "session=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = SessionConfig::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let Some(token) = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SESSION_TOKEN").ok())
    else {
        bail!("usage: session-probe <token> (or set SESSION_TOKEN)");
    };

    let auth = ServerAuth::from_config(&config)?;
    info!(base_path = %config.base_path, "Resolving verification context");

    let session = auth
        .verify_token(&token)
        .await
        .context("session token rejected")?;
    auth.close();

    println!("{}", serde_json::to_string_pretty(&session)?);
    Ok(())
}
