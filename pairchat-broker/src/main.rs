//! `PairChat` broker: STOMP-over-WebSocket message broker with a history
//! endpoint.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000, accepting any token
//! cargo run --bin pairchat-broker
//!
//! # Custom address and a token allow-list
//! cargo run --bin pairchat-broker -- --bind 127.0.0.1:8080 --token dev --token staging
//! ```

use std::sync::Arc;

use clap::Parser;
use pairchat_broker::broker::{self, BrokerState};
use pairchat_broker::config::{BrokerCliArgs, BrokerConfig};
use pairchat_broker::store::ConversationStore;

#[tokio::main]
async fn main() {
    let cli = BrokerCliArgs::parse();

    let config = match BrokerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    if config.tokens.is_empty() {
        tracing::warn!("no tokens configured, accepting any credential");
    }
    tracing::info!(addr = %config.bind_addr, "starting pairchat broker");

    let store = ConversationStore::with_max_log_size(config.max_log_size);
    let state = Arc::new(BrokerState::with_config(
        config.tokens,
        config.heartbeat,
        config.max_body_size,
        store,
    ));

    match broker::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "broker listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "broker task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start broker");
            std::process::exit(1);
        }
    }
}
