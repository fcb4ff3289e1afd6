//! Origin fetching and content-type sniffing

use crate::error::{MediaProxyError, Result};
use reqwest::Client;
use tracing::{debug, warn};

/// HTTP client for fetching media bytes from origin servers
#[derive(Clone)]
pub struct MediaFetcher {
    client: Client,
}

impl MediaFetcher {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Fetch the raw bytes behind `url`.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        debug!(url = %url, "Fetching from origin");
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            warn!(status = %response.status(), url = %url, "Origin fetch failed");
            return Err(MediaProxyError::Fetch(format!(
                "origin returned status {}",
                response.status()
            )));
        }

        let data = response.bytes().await?.to_vec();
        debug!(url = %url, size = data.len(), "Fetched from origin");
        Ok(data)
    }
}

impl Default for MediaFetcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Guess a content type from magic bytes, for serving cached values whose
/// response headers were not kept.
pub fn sniff_content_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        "image/gif"
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}
