//! `Rundown` server -- authoritative service timer with live fan-out.
//!
//! An axum WebSocket server that stores services and their agendas, runs the
//! per-service timer state machine, and pushes every committed snapshot to
//! subscribed clients.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9100 with in-memory storage
//! cargo run --bin rundown-server
//!
//! # Persist to a JSON file and bind elsewhere
//! cargo run --bin rundown-server -- --bind 127.0.0.1:8080 --data-file rundown.json
//! ```

use std::sync::Arc;

use clap::Parser;
use rundown_proto::timer::SystemClock;
use rundown_server::channel::{self, ServerOptions, ServerState};
use rundown_server::config::{ServerCliArgs, ServerConfig};
use rundown_server::identity::StaticIdentityProvider;
use rundown_server::store::{InMemoryStore, JsonFileStore, RelationalStore};

#[tokio::main]
async fn main() {
    let cli = ServerCliArgs::parse();

    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let identity = StaticIdentityProvider::from_entries(&config.users);
    if identity.is_empty() {
        tracing::warn!("no users configured; every connection will be refused");
    }

    tracing::info!(addr = %config.bind_addr, "starting rundown server");

    if let Some(path) = config.data_file.clone() {
        match JsonFileStore::open(&path).await {
            Ok(store) => run(&config, store, identity).await,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to open data file");
                std::process::exit(1);
            }
        }
    } else {
        tracing::warn!("no data file configured; services are kept in memory only");
        run(&config, InMemoryStore::new(), identity).await;
    }
}

async fn run<S>(config: &ServerConfig, store: S, identity: StaticIdentityProvider)
where
    S: RelationalStore + 'static,
{
    let options = ServerOptions {
        max_frame_size: config.max_frame_size,
        feed_capacity: config.feed_capacity,
    };
    let state = Arc::new(ServerState::with_options(
        Arc::new(store),
        identity,
        options,
        Arc::new(SystemClock),
    ));

    match channel::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    }
}
