//! HTTP server for the media cache proxy
//!
//! Provides /health, /image?url=..., and DELETE /cache endpoints.

use crate::fetch::{sniff_content_type, MediaFetcher};
use crate::types::{HealthResponse, RawCodec};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tiered_blob_cache::TieredCache;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Shared state for the HTTP server
pub struct ServerState {
    pub cache: TieredCache<RawCodec>,
    pub fetcher: MediaFetcher,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(cache: TieredCache<RawCodec>, fetcher: MediaFetcher) -> Self {
        Self {
            cache,
            fetcher,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Deserialize)]
struct ImageQuery {
    url: String,
}

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/image", get(get_image))
        .route("/cache", delete(clear_cache))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let cache_stats = state.cache.stats().await;
    let disk_size = state.cache.size_report().await;
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache: cache_stats,
        disk_size,
    })
}

/// Serve an image by origin URL, fetching and caching on miss
async fn get_image(
    State(state): State<SharedState>,
    Query(query): Query<ImageQuery>,
) -> Response {
    let url = query.url;

    let fetched = Arc::new(AtomicBool::new(false));
    let fetch_flag = fetched.clone();
    let fetcher = state.fetcher.clone();
    let fetch_url = url.clone();
    let result = state
        .cache
        .get_or_fetch(&url, move || {
            fetch_flag.store(true, Ordering::Relaxed);
            async move {
                fetcher
                    .fetch(&fetch_url)
                    .await
                    .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })
            }
        })
        .await;

    match result {
        Ok(Some(data)) => {
            let cache_header = if fetched.load(Ordering::Relaxed) {
                "MISS"
            } else {
                "HIT"
            };
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, sniff_content_type(&data))
                .header(header::CACHE_CONTROL, "public, max-age=86400")
                .header("X-Cache", cache_header)
                .body(Body::from(data.as_ref().clone()))
                .unwrap()
        }
        Ok(None) => {
            warn!(url = %url, "Image unavailable");
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: "Image not found".to_string(),
                }),
            )
                .into_response()
        }
        Err(e) => {
            warn!(url = %url, error = %e, "Cache misconfigured");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Cache unavailable".to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Flush the journal and evict the memory tier
async fn clear_cache(State(state): State<SharedState>) -> Response {
    match state.cache.clear().await {
        Ok(()) => {
            let disk_size = state.cache.size_report().await;
            info!(disk_size = %disk_size, "Cache cleared");
            Json(serde_json::json!({ "status": "cleared", "disk_size": disk_size }))
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "Failed to clear cache");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Failed to clear cache".to_string(),
                }),
            )
                .into_response()
        }
    }
}
