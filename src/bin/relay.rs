//! Phone Pilot authorization relay
//!
//! Serves pending authorization requests to humans over HTTP.
//! Run with: cargo run --bin phone-pilot-relay
//!
//! Environment:
//! - `RELAY_LISTEN` (default `127.0.0.1:8787`)
//! - `RELAY_PUBLIC_URL` (default `http://<RELAY_LISTEN>`)
//! - `RELAY_API_KEY` (optional, required from agents when set)

use phone_pilot::auth::relay::{serve, RelayConfig, RelayState};
use std::env;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LISTEN: &str = "127.0.0.1:8787";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let listen = env::var("RELAY_LISTEN").unwrap_or_else(|_| DEFAULT_LISTEN.to_string());
    let public_url = env::var("RELAY_PUBLIC_URL").unwrap_or_else(|_| format!("http://{}", listen));
    let api_key = env::var("RELAY_API_KEY").unwrap_or_default();

    if api_key.is_empty() {
        warn!("RELAY_API_KEY is not set; any client can create requests");
    }
    info!(%public_url, "Relay public URL");

    let state = RelayState::new(RelayConfig::new(public_url).with_api_key(&api_key));
    serve(&listen, state).await?;
    Ok(())
}
