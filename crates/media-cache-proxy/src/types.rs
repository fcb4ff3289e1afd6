//! Core types for the media cache proxy

use serde::Serialize;
use std::path::PathBuf;
use tiered_blob_cache::{CacheStats, Codec};

/// Configuration for the proxy
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub cache_dir: PathBuf,
    pub memory_cache_size: u64,
    pub disk_cache_size: u64,
    pub schema_version: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 3002,
            cache_dir: PathBuf::from("./cache/media"),
            memory_cache_size: 32 * 1024 * 1024, // 32MB
            disk_cache_size: 64 * 1024 * 1024,   // 64MB
            schema_version: 1,
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
    pub disk_size: String,
}

/// Identity codec: the proxy caches encoded media bytes as-is and leaves
/// decoding to the browser.
pub struct RawCodec;

impl Codec for RawCodec {
    type Value = Vec<u8>;

    fn decode(&self, bytes: &[u8]) -> tiered_blob_cache::Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn encode(&self, value: &Vec<u8>) -> tiered_blob_cache::Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn size_of(&self, value: &Vec<u8>) -> u64 {
        value.len() as u64
    }
}
