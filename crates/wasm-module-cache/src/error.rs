//! Error types for the module cache.

use std::path::PathBuf;
use std::time::Duration;

/// Module cache errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Download reference uses a scheme no source is registered for.
    #[error("unsupported scheme {scheme:?} in {url}")]
    UnsupportedScheme { url: String, scheme: String },

    /// Download reference could not be parsed.
    #[error("invalid module reference: {reference} - {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Transport-level failure (network, auth, registry error).
    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    /// The fetch did not complete within the caller's timeout.
    #[error("fetching {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    /// Caller-supplied checksum disagrees with the resolved content digest.
    #[error("module checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    /// Fetched bytes are not a WebAssembly binary.
    #[error("fetched module {url} is not a valid wasm binary: {reason}")]
    InvalidModule { url: String, reason: String },

    /// Local file write or delete failed.
    #[error("cache persistence failed for {}: {message}", path.display())]
    Persistence { path: PathBuf, message: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl CacheError {
    /// Whether a fresh `get` for the same module may succeed.
    ///
    /// The cache never retries on its own; this only informs callers.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch { .. } | Self::Timeout { .. })
    }

    /// Whether the error points at tampered or stale content.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::InvalidModule { .. }
        )
    }

    pub(crate) fn fetch(url: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Fetch {
            url: url.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::Persistence {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
