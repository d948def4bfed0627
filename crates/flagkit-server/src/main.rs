//! Flagkit Server Binary
//!
//! Loads configuration from the standard locations and serves the REST API.

use std::sync::Arc;

use flagkit_core::FlagkitConfig;
use flagkit_server::{serve, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = FlagkitConfig::load_standard()?;
    config.validate()?;

    let state = Arc::new(AppState::from_config(&config)?);
    let addr = std::env::var("FLAGKIT_ADDR").unwrap_or_else(|_| config.server.bind_addr.clone());

    serve(&addr, state).await
}
