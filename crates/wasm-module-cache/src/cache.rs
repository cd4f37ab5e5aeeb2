//! Fetch dispatcher: the public entry point of the cache.
//!
//! [`ModuleCache::get`] answers from the store when it can and otherwise
//! resolves the URL through the source registered for its scheme, checks the
//! digest against the caller's checksum, validates the binary and persists
//! it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::digest::normalize_checksum;
use crate::error::{CacheError, CacheResult};
use crate::key::LookupRequest;
use crate::observer::{CacheObserver, FetchOutcome, NoopObserver};
use crate::reference::scheme;
use crate::source::{FetchContext, ModuleSource, SourceRegistry};
use crate::store::ModuleStore;
use crate::sweeper::Sweeper;
use crate::validate::validate_module;

/// Local cache of remote WebAssembly modules.
///
/// Safe to share between tasks; every method takes `&self`. Dropping the
/// cache stops its background sweeper.
pub struct ModuleCache {
    config: CacheConfig,
    store: Arc<ModuleStore>,
    sources: SourceRegistry,
    observer: Arc<dyn CacheObserver>,
    sweeper: Sweeper,
}

impl std::fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCache")
            .field("store", &self.store)
            .field("sources", &self.sources)
            .field("sweeper_stopped", &self.sweeper.is_stopped())
            .finish()
    }
}

/// Builder for [`ModuleCache`].
pub struct ModuleCacheBuilder {
    config: CacheConfig,
    purge_interval: Duration,
    module_expiry: Duration,
    sources: Vec<(String, Arc<dyn ModuleSource>)>,
    observer: Arc<dyn CacheObserver>,
}

impl ModuleCacheBuilder {
    fn new(config: CacheConfig) -> Self {
        Self {
            purge_interval: config.purge_interval(),
            module_expiry: config.module_expiry(),
            config,
            sources: Vec::new(),
            observer: Arc::new(NoopObserver),
        }
    }

    /// Register `source` for `scheme`, replacing the default one.
    pub fn with_source(mut self, scheme: &str, source: Arc<dyn ModuleSource>) -> Self {
        self.sources.push((scheme.to_string(), source));
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CacheObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Override the configured sweep interval.
    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }

    /// Override the configured entry expiry.
    pub fn with_module_expiry(mut self, expiry: Duration) -> Self {
        self.module_expiry = expiry;
        self
    }

    /// Create the cache directory and start the sweeper.
    ///
    /// Must be called within a tokio runtime.
    pub fn build(self) -> CacheResult<ModuleCache> {
        let mut sources = SourceRegistry::with_defaults(&self.config)?;
        for (scheme, source) in self.sources {
            sources.register(&scheme, source);
        }

        let store = Arc::new(ModuleStore::with_observer(
            self.config.dir.clone(),
            self.module_expiry,
            self.observer.clone(),
        )?);
        let sweeper = Sweeper::spawn(store.clone(), self.purge_interval)?;

        debug!(
            dir = %store.dir().display(),
            expiry = ?self.module_expiry,
            purge_interval = ?self.purge_interval,
            schemes = ?sources.schemes(),
            "module cache started"
        );

        Ok(ModuleCache {
            config: self.config,
            store,
            sources,
            observer: self.observer,
            sweeper,
        })
    }
}

/// A failed fetch and how it is reported.
struct Failed {
    error: CacheError,
    outcome: FetchOutcome,
}

impl Failed {
    fn new(error: CacheError, default: FetchOutcome) -> Self {
        let outcome = match &error {
            CacheError::UnsupportedScheme { .. } => FetchOutcome::UnsupportedScheme,
            CacheError::ChecksumMismatch { .. } => FetchOutcome::ChecksumMismatch,
            CacheError::InvalidModule { .. } => FetchOutcome::InvalidModule,
            CacheError::Persistence { .. } => FetchOutcome::PersistenceFailure,
            _ => default,
        };
        Self { error, outcome }
    }
}

enum Fetched {
    /// A re-check with the resolved digest found the module.
    Cached(PathBuf),
    Downloaded(LookupRequest, Vec<u8>),
}

impl ModuleCache {
    /// Cache with the default sources.
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: CacheConfig) -> ModuleCacheBuilder {
        ModuleCacheBuilder::new(config)
    }

    /// Local path of the module at `download_url`.
    ///
    /// `checksum` is the expected hex SHA-256 (optionally `sha256:`
    /// prefixed); empty means "whatever the URL currently resolves to". For
    /// OCI URLs the checksum is the image manifest digest. `timeout` bounds
    /// the network part of the call; `Duration::ZERO` leaves it unbounded.
    /// `pull_secret` is a Docker config JSON used for registry auth.
    ///
    /// A cached module is returned without network I/O. Nothing is cached
    /// unless the module downloads, matches `checksum` and is a wasm binary.
    pub async fn get(
        &self,
        download_url: &str,
        checksum: &str,
        timeout: Duration,
        pull_secret: Option<&[u8]>,
    ) -> CacheResult<PathBuf> {
        let request = LookupRequest::new(download_url, checksum);
        if let Some(path) = self.store.lookup(&request) {
            return Ok(path);
        }

        match self.fetch(&request, timeout, pull_secret).await {
            Ok(path) => {
                self.observer.fetch_finished(FetchOutcome::Success);
                Ok(path)
            }
            Err(Failed { error, outcome }) => {
                warn!(url = %download_url, error = %error, outcome = %outcome, "module fetch failed");
                self.observer.fetch_finished(outcome);
                Err(error)
            }
        }
    }

    async fn fetch(
        &self,
        request: &LookupRequest,
        timeout: Duration,
        pull_secret: Option<&[u8]>,
    ) -> Result<PathBuf, Failed> {
        let url = request.download_url.as_str();

        let scheme = scheme(url).map_err(|e| Failed::new(e, FetchOutcome::UnsupportedScheme))?;
        let source = self.sources.get(&scheme).ok_or_else(|| {
            Failed::new(
                CacheError::UnsupportedScheme {
                    url: url.to_string(),
                    scheme: scheme.clone(),
                },
                FetchOutcome::UnsupportedScheme,
            )
        })?;

        let ctx = FetchContext {
            timeout,
            pull_secret: pull_secret.map(<[u8]>::to_vec),
            insecure: self.config.is_insecure(host_of(url)),
        };

        let network = self.resolve_and_download(source.as_ref(), request, &ctx);
        let fetched = if timeout.is_zero() {
            network.await?
        } else {
            match tokio::time::timeout(timeout, network).await {
                Ok(fetched) => fetched?,
                Err(_) => {
                    return Err(Failed::new(
                        CacheError::Timeout {
                            url: url.to_string(),
                            timeout,
                        },
                        FetchOutcome::DownloadFailure,
                    ))
                }
            }
        };

        let (request, bytes) = match fetched {
            Fetched::Cached(path) => return Ok(path),
            Fetched::Downloaded(request, bytes) => (request, bytes),
        };

        validate_module(url, &bytes).map_err(|e| Failed::new(e, FetchOutcome::InvalidModule))?;

        self.store
            .insert(&request.identity, &bytes, url)
            .await
            .map_err(|e| Failed::new(e, FetchOutcome::PersistenceFailure))
    }

    async fn resolve_and_download(
        &self,
        source: &dyn ModuleSource,
        request: &LookupRequest,
        ctx: &FetchContext,
    ) -> Result<Fetched, Failed> {
        let url = request.download_url.as_str();

        let resolved = source
            .resolve(url, ctx)
            .await
            .map_err(|e| Failed::new(e, source.resolve_failure()))?;
        let digest = normalize_checksum(&resolved.digest);

        let request = if request.identity.has_checksum() {
            if request.identity.checksum != digest {
                return Err(Failed::new(
                    CacheError::ChecksumMismatch {
                        url: url.to_string(),
                        expected: request.identity.checksum.clone(),
                        actual: digest,
                    },
                    FetchOutcome::ChecksumMismatch,
                ));
            }
            request.clone()
        } else {
            let request = request.resolved(&digest);
            if let Some(path) = self.store.lookup_resolved(&request.identity, url) {
                debug!(url, checksum = %digest, "resolved digest already cached");
                return Ok(Fetched::Cached(path));
            }
            request
        };

        let bytes = resolved
            .payload
            .into_bytes()
            .await
            .map_err(|e| Failed::new(e, FetchOutcome::DownloadFailure))?;

        Ok(Fetched::Downloaded(request, bytes))
    }

    /// Stop the background sweeper. Idempotent.
    ///
    /// Lookups and fetches keep working; entries just stop expiring.
    pub fn cleanup(&self) {
        self.sweeper.stop();
    }

    /// Stop the sweeper and wait for a running sweep to finish.
    pub async fn shutdown(&self) {
        self.sweeper.shutdown().await;
    }

    pub fn store(&self) -> &Arc<ModuleStore> {
        &self.store
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }
}

/// Host (with port) of a `scheme://host/...` URL.
fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let end = rest.find(['/', '@', '?', '#']).unwrap_or(rest.len());
    &rest[..end]
}
