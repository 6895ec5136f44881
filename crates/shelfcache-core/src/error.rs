//! Error types for the shelfcache store.
//!
//! Read paths absorb storage failures and report a miss; everything defined
//! here is what write paths, startup, and caller-side decoding surface.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the cache layer.
#[derive(Debug, Error)]
pub enum CacheError {
    // Storage errors
    #[error("Storage unavailable: {message}")]
    StorageUnavailable {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("Timed out after {0:?} waiting for the cache write path")]
    LockTimeout(Duration),

    #[error("Cache schema mismatch: found {found}, expected {expected}")]
    SchemaMismatch { found: String, expected: String },

    // Payload errors
    #[error("Corrupt cache entry {namespace}/{key}: {message}")]
    CorruptEntry {
        namespace: String,
        key: String,
        message: String,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },
}

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        CacheError::StorageUnavailable {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl CacheError {
    /// Wrap a rusqlite error with a description of what was being attempted.
    pub fn storage(context: &str, err: rusqlite::Error) -> Self {
        CacheError::StorageUnavailable {
            message: format!("{}: {}", context, err),
            source: Some(err),
        }
    }

    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        CacheError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// True for conditions where the storage medium could not be reached.
    ///
    /// Read paths treat these as a miss; write paths return them.
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(
            self,
            CacheError::StorageUnavailable { .. } | CacheError::LockTimeout(_)
        )
    }

    /// True when deleting the offending entry and re-fetching from origin
    /// resolves the error.
    pub fn is_recoverable_by_eviction(&self) -> bool {
        matches!(self, CacheError::CorruptEntry { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheError::SchemaMismatch {
            found: "version 7".into(),
            expected: "version 1".into(),
        };
        assert_eq!(
            err.to_string(),
            "Cache schema mismatch: found version 7, expected version 1"
        );
    }

    #[test]
    fn test_storage_classification() {
        assert!(CacheError::LockTimeout(Duration::from_millis(50)).is_storage_unavailable());
        assert!(CacheError::from(rusqlite::Error::InvalidQuery).is_storage_unavailable());
        assert!(!CacheError::Config {
            message: "bad".into()
        }
        .is_storage_unavailable());
    }

    #[test]
    fn test_corrupt_entry_is_recoverable() {
        let err = CacheError::CorruptEntry {
            namespace: "catalog".into(),
            key: "B08XYZ".into(),
            message: "expected value".into(),
        };
        assert!(err.is_recoverable_by_eviction());
        assert!(!err.is_storage_unavailable());
    }
}
