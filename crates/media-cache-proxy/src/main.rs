//! Media Cache Proxy - caching HTTP proxy for media bytes
//!
//! Serves images by origin URL through a two-tier cache: an in-memory LRU in
//! front of a journaled on-disk LRU. Misses are fetched from the origin and
//! written through to both tiers.

mod error;
mod fetch;
mod server;
mod types;

use crate::error::{MediaProxyError, Result};
use crate::fetch::MediaFetcher;
use crate::server::{start_server, ServerState, SharedState};
use crate::types::{ProxyConfig, RawCodec};
use std::path::PathBuf;
use std::sync::Arc;
use tiered_blob_cache::TieredCache;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter =
        EnvFilter::from_default_env().add_directive("media_cache_proxy=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting Media Cache Proxy...");

    // Load configuration from environment
    let config = load_config();
    info!("Port: {}", config.port);
    info!("Cache dir: {:?}", config.cache_dir);
    info!(
        "Memory cache size: {} MB",
        config.memory_cache_size / (1024 * 1024)
    );
    info!(
        "Disk cache size: {} MB",
        config.disk_cache_size / (1024 * 1024)
    );
    info!("Schema version: {}", config.schema_version);

    // Create the cache and bring up both tiers; disk opens in the background
    let cache = TieredCache::new(RawCodec);
    cache.init_memory(config.memory_cache_size)?;
    cache.init_disk(
        config.cache_dir,
        config.schema_version,
        config.disk_cache_size,
    )?;

    let fetcher = MediaFetcher::new();

    // Create shared state
    let state: SharedState = Arc::new(ServerState::new(cache, fetcher));

    // Start HTTP server (blocking)
    start_server(state, config.port)
        .await
        .map_err(|e| MediaProxyError::Config(format!("Server error: {}", e)))?;

    Ok(())
}

fn load_config() -> ProxyConfig {
    let defaults = ProxyConfig::default();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(defaults.port);

    let cache_dir = std::env::var("CACHE_DIR")
        .map(PathBuf::from)
        .unwrap_or(defaults.cache_dir);

    let memory_cache_size = std::env::var("MEMORY_CACHE_SIZE")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(defaults.memory_cache_size);

    let disk_cache_size = std::env::var("DISK_CACHE_SIZE")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(defaults.disk_cache_size);

    let schema_version = std::env::var("CACHE_SCHEMA_VERSION")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(defaults.schema_version);

    ProxyConfig {
        port,
        cache_dir,
        memory_cache_size,
        disk_cache_size,
        schema_version,
    }
}
