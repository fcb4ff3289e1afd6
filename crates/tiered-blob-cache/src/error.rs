//! Error types for the tiered blob cache

use std::fmt;

#[derive(Debug)]
pub enum CacheError {
    /// Underlying filesystem failure. Treated as a miss by the coordinator.
    Io(Box<std::io::Error>),
    /// Bad configuration (zero capacity, double init). Fatal, caller error.
    Config(String),
    /// A single value larger than the tier capacity; the put was a no-op.
    ValueTooLarge { size: u64, capacity: u64 },
    /// The journal could not be parsed. The disk tier recovers by wiping
    /// itself, so this surfaces only in logs, never to cache callers.
    JournalCorrupt(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Io(err) => write!(f, "IO error: {}", err),
            CacheError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CacheError::ValueTooLarge { size, capacity } => {
                write!(f, "Value of {} bytes exceeds tier capacity of {} bytes", size, capacity)
            }
            CacheError::JournalCorrupt(msg) => write!(f, "Corrupt journal: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display() {
        let err = CacheError::from(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing journal",
        ));
        assert!(format!("{}", err).contains("missing journal"));
    }

    #[test]
    fn test_config_error_display() {
        let err = CacheError::Config("memory capacity must be non-zero".to_string());
        assert_eq!(
            format!("{}", err),
            "Configuration error: memory capacity must be non-zero"
        );
    }

    #[test]
    fn test_value_too_large_display() {
        let err = CacheError::ValueTooLarge { size: 2048, capacity: 1024 };
        assert_eq!(
            format!("{}", err),
            "Value of 2048 bytes exceeds tier capacity of 1024 bytes"
        );
    }

    #[test]
    fn test_io_error_has_source() {
        use std::error::Error;
        let err = CacheError::from(std::io::Error::other("disk on fire"));
        assert!(err.source().is_some());
        let err = CacheError::Config("bad".to_string());
        assert!(err.source().is_none());
    }
}
