//! Module sources, selected by URL scheme.
//!
//! A source turns a download URL into a content digest and the module bytes.
//! HTTP sources download eagerly; OCI sources resolve the digest from
//! registry metadata and defer the payload download until the cache knows it
//! actually needs it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::CacheConfig;
use crate::error::CacheResult;
use crate::observer::FetchOutcome;

pub mod http;
pub mod oci;

pub use http::HttpSource;
pub use oci::OciSource;

const USER_AGENT_VALUE: &str = concat!("wasm-module-cache/", env!("CARGO_PKG_VERSION"));

/// Per-request parameters handed to a source.
#[derive(Debug, Clone, Default)]
pub struct FetchContext {
    /// Upper bound for each network request.
    pub timeout: Duration,

    /// Registry credentials (Docker config JSON), if any.
    pub pull_secret: Option<Vec<u8>>,

    /// Contact the registry over plain HTTP.
    pub insecure: bool,
}

/// Deferred payload download.
#[async_trait]
pub trait DeferredFetch: Send {
    async fn fetch(self: Box<Self>) -> CacheResult<Vec<u8>>;
}

/// Module bytes, either in hand or still to be downloaded.
pub enum Payload {
    Ready(Vec<u8>),
    Deferred(Box<dyn DeferredFetch>),
}

impl Payload {
    /// Materialise the bytes, downloading them if deferred.
    pub async fn into_bytes(self) -> CacheResult<Vec<u8>> {
        match self {
            Self::Ready(bytes) => Ok(bytes),
            Self::Deferred(fetch) => fetch.fetch().await,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(bytes) => write!(f, "Ready({} bytes)", bytes.len()),
            Self::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

/// Result of resolving a URL.
#[derive(Debug)]
pub struct Resolved {
    /// Hex SHA-256 identifying the module content.
    pub digest: String,
    pub payload: Payload,
}

/// A transport for one or more URL schemes.
#[async_trait]
pub trait ModuleSource: Send + Sync {
    /// Resolve `url` to a digest and payload.
    async fn resolve(&self, url: &str, ctx: &FetchContext) -> CacheResult<Resolved>;

    /// How a failed `resolve` is reported to observers.
    fn resolve_failure(&self) -> FetchOutcome {
        FetchOutcome::DownloadFailure
    }
}

/// Sources keyed by lowercase scheme.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: HashMap<String, Arc<dyn ModuleSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `http`, `https` and `oci` sources configured from `config`.
    pub fn with_defaults(config: &CacheConfig) -> CacheResult<Self> {
        let http: Arc<dyn ModuleSource> = Arc::new(HttpSource::new(config.http_max_retries)?);
        let oci: Arc<dyn ModuleSource> = Arc::new(OciSource::new()?);

        let mut registry = Self::new();
        registry.register("http", http.clone());
        registry.register("https", http);
        registry.register("oci", oci);
        Ok(registry)
    }

    /// Register `source` for `scheme`, replacing any previous one.
    pub fn register(&mut self, scheme: &str, source: Arc<dyn ModuleSource>) {
        self.sources.insert(scheme.to_ascii_lowercase(), source);
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn ModuleSource>> {
        self.sources.get(scheme).cloned()
    }

    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}
