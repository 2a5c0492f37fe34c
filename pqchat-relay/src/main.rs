//! `PQChat` Relay Server -- signaling relay for end-to-end encrypted chat.
//!
//! An axum WebSocket server that registers clients, tracks named rooms, and
//! routes key-exchange material and encrypted payloads between clients. The
//! relay never sees plaintext -- it only forwards opaque blobs by client id.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:8080
//! cargo run --bin pqchat-relay
//!
//! # Run on custom address
//! cargo run --bin pqchat-relay -- --bind 127.0.0.1:9000
//!
//! # Or via environment variable
//! PQCHAT_ADDR=127.0.0.1:9000 cargo run --bin pqchat-relay
//! ```

use std::sync::Arc;

use clap::Parser;
use pqchat_relay::config::{RelayCliArgs, RelayConfig};
use pqchat_relay::relay::{self, RelayState};

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting pqchat relay server");

    let state = Arc::new(RelayState::with_config(&config));

    match relay::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "relay server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}
