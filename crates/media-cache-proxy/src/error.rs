//! Error types for the media cache proxy

use std::fmt;

#[derive(Debug)]
pub enum MediaProxyError {
    Cache(tiered_blob_cache::CacheError),
    Fetch(String),
    Io(Box<std::io::Error>),
    Config(String),
}

impl fmt::Display for MediaProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaProxyError::Cache(err) => write!(f, "Cache error: {}", err),
            MediaProxyError::Fetch(msg) => write!(f, "Fetch error: {}", msg),
            MediaProxyError::Io(err) => write!(f, "IO error: {}", err),
            MediaProxyError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for MediaProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MediaProxyError::Cache(err) => Some(err),
            MediaProxyError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<tiered_blob_cache::CacheError> for MediaProxyError {
    fn from(err: tiered_blob_cache::CacheError) -> Self {
        MediaProxyError::Cache(err)
    }
}

impl From<reqwest::Error> for MediaProxyError {
    fn from(err: reqwest::Error) -> Self {
        MediaProxyError::Fetch(err.to_string())
    }
}

impl From<std::io::Error> for MediaProxyError {
    fn from(err: std::io::Error) -> Self {
        MediaProxyError::Io(Box::new(err))
    }
}

impl From<tracing_subscriber::filter::ParseError> for MediaProxyError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        MediaProxyError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MediaProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display() {
        let err = MediaProxyError::Fetch("origin returned 502".to_string());
        assert_eq!(format!("{}", err), "Fetch error: origin returned 502");
    }

    #[test]
    fn test_config_error_display() {
        let err = MediaProxyError::Config("bad PORT".to_string());
        assert_eq!(format!("{}", err), "Configuration error: bad PORT");
    }

    #[test]
    fn test_cache_error_wraps_source() {
        use std::error::Error;
        let err = MediaProxyError::from(tiered_blob_cache::CacheError::Config(
            "zero capacity".to_string(),
        ));
        assert!(format!("{}", err).contains("zero capacity"));
        assert!(err.source().is_some());
    }
}
