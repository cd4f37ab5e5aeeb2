//! Telemetry hooks.
//!
//! Observers receive fire-and-forget notifications about cache activity. They
//! are never consulted for control flow.

/// Result classification of one `get` that reached the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchOutcome {
    Success,
    DownloadFailure,
    ManifestFailure,
    ChecksumMismatch,
    InvalidModule,
    UnsupportedScheme,
    PersistenceFailure,
}

impl FetchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::DownloadFailure => "download_failure",
            Self::ManifestFailure => "manifest_failure",
            Self::ChecksumMismatch => "checksum_mismatched",
            Self::InvalidModule => "invalid_module",
            Self::UnsupportedScheme => "unsupported_scheme",
            Self::PersistenceFailure => "persistence_failure",
        }
    }
}

impl std::fmt::Display for FetchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for cache telemetry.
pub trait CacheObserver: Send + Sync {
    /// A `get` finished after contacting a source.
    fn fetch_finished(&self, _outcome: FetchOutcome) {}

    /// A store lookup completed.
    fn lookup(&self, _hit: bool) {}

    /// Number of indexed entries after a mutation.
    fn entries(&self, _count: usize) {}
}

/// Observer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl CacheObserver for NoopObserver {}
