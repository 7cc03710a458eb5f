//! kv-radix-cache: prefix-indexed KV cache server.
//!
//! Inference workers look up the longest cached prefix of a prompt, read the
//! per-layer KV state of cached tokens and push newly computed state. Updates
//! accumulate in an open revision that is published by a seal request.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use kv_radix_cache::config::{Cli, Config};
use kv_radix_cache::server::api::{build_router, AppState};
use kv_radix_cache::storage::open_store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "kv_radix_cache=debug,tower_http=debug"
    } else {
        "kv_radix_cache=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("kv-radix-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    let config = Arc::new(config);

    info!(
        tensor_nbytes = config.cache.tensor_nbytes,
        layer = config.cache.layer,
        block_size = config.cache.block_size,
        cache_capacity = config.cache.cache_capacity,
        "Configuration loaded"
    );
    info!(
        slot_bytes = config.slot_bytes(),
        max_blocks = config.max_blocks(),
        backend = ?config.storage.backend,
        "Cache sizing"
    );

    // Open the backing object store.
    let store = open_store(&config.storage)?;

    // Build application state, resuming the last published revision if any.
    let state = Arc::new(AppState::new(config.clone(), store)?);

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    info!(addr = %listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
