//! In-memory index over checksum-named module files.
//!
//! # Layout
//!
//! ```text
//! {dir}/
//!   {sha256}.wasm
//! ```
//!
//! The index maps [`ModuleIdentity`] to an entry holding the file path, the
//! last touch time and the tag-based URLs believed to resolve to it. A second
//! map short-cuts tag-based OCI URLs to their last known checksum. One mutex
//! guards both maps and is never held across network or async file I/O.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::CacheResult;
use crate::key::{LookupRequest, ModuleIdentity};
use crate::observer::{CacheObserver, NoopObserver};
use crate::reference::{is_tagged_oci, pinned_digest};

mod evict;
mod io;

pub use evict::SweepReport;

/// File extension of cached modules.
pub const MODULE_EXTENSION: &str = "wasm";

#[derive(Debug, Clone)]
struct CacheEntry {
    path: PathBuf,
    last_touched: Instant,
    /// Tag-based URLs currently short-cut to this entry's checksum.
    referencing_urls: HashSet<String>,
}

#[derive(Debug, Default)]
struct StoreState {
    entries: HashMap<ModuleIdentity, CacheEntry>,
    /// Tag-based URL -> checksum.
    checksums: HashMap<String, String>,
    /// Checksum -> inserts currently writing its file.
    writing: HashMap<String, usize>,
}

impl StoreState {
    /// Record that tag-based `url` currently resolves to `identity`.
    fn bind_url(&mut self, identity: &ModuleIdentity, url: &str) {
        if let Some(entry) = self.entries.get_mut(identity) {
            entry.referencing_urls.insert(url.to_string());
            self.checksums
                .insert(url.to_string(), identity.checksum.clone());
        }
    }

    /// Whether an insert is writing the file for `checksum`.
    fn is_writing(&self, checksum: &str) -> bool {
        self.writing.contains_key(checksum)
    }

    fn finish_write(&mut self, checksum: &str) {
        if let Some(count) = self.writing.get_mut(checksum) {
            *count -= 1;
            if *count == 0 {
                self.writing.remove(checksum);
            }
        }
    }
}

/// An insert that may write the file for its checksum.
enum Slot<'a> {
    Cached(PathBuf),
    Reserved(PendingWrite<'a>),
}

/// Keeps the sweep away from a checksum's file until dropped, including
/// when the inserting future is cancelled mid-write.
struct PendingWrite<'a> {
    store: &'a ModuleStore,
    checksum: String,
}

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        self.store.lock().finish_write(&self.checksum);
    }
}

/// Thread-safe module index backed by a flat directory.
pub struct ModuleStore {
    dir: PathBuf,
    expiry: Duration,
    state: Mutex<StoreState>,
    observer: Arc<dyn CacheObserver>,
}

impl std::fmt::Debug for ModuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleStore")
            .field("dir", &self.dir)
            .field("expiry", &self.expiry)
            .field("entries", &self.len())
            .finish()
    }
}

impl ModuleStore {
    /// Create a store over `dir`, creating the directory if needed.
    ///
    /// The index starts empty; files left over from earlier processes are
    /// not adopted.
    pub fn new(dir: impl Into<PathBuf>, expiry: Duration) -> CacheResult<Self> {
        Self::with_observer(dir, expiry, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        dir: impl Into<PathBuf>,
        expiry: Duration,
        observer: Arc<dyn CacheObserver>,
    ) -> CacheResult<Self> {
        let dir = dir.into();
        io::ensure_dir(&dir)?;
        Ok(Self {
            dir,
            expiry,
            state: Mutex::new(StoreState::default()),
            observer,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deterministic file path for `checksum`.
    pub fn path_for(&self, checksum: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", checksum, MODULE_EXTENSION))
    }

    /// Find an entry satisfying `request`, touching it on hit.
    ///
    /// A request without checksum uses the digest pinned in an OCI URL, or
    /// else the last checksum seen for a tag-based URL. Neither map is
    /// mutated by that resolution.
    pub fn lookup(&self, request: &LookupRequest) -> Option<PathBuf> {
        let found = {
            let mut state = self.lock();
            let checksum = if request.identity.has_checksum() {
                Some(request.identity.checksum.clone())
            } else if let Some(digest) = pinned_digest(&request.download_url) {
                Some(digest)
            } else {
                state.checksums.get(&request.download_url).cloned()
            };

            checksum.and_then(|checksum| {
                let key = request.identity.with_checksum(checksum);
                state.entries.get_mut(&key).map(|entry| {
                    entry.last_touched = Instant::now();
                    entry.path.clone()
                })
            })
        };

        self.observer.lookup(found.is_some());
        match &found {
            Some(path) => debug!(url = %request.download_url, path = %path.display(), "module cache hit"),
            None => debug!(url = %request.download_url, "module cache miss"),
        }
        found
    }

    /// Like [`lookup`](Self::lookup) for a freshly resolved identity, and on
    /// hit also records `download_url` as a tag-based reference to it.
    ///
    /// Not reported to the observer: it re-checks a `get` whose first lookup
    /// already counted as a miss.
    pub fn lookup_resolved(&self, identity: &ModuleIdentity, download_url: &str) -> Option<PathBuf> {
        let found = {
            let mut state = self.lock();
            let path = state.entries.get_mut(identity).map(|entry| {
                entry.last_touched = Instant::now();
                entry.path.clone()
            });
            if path.is_some() && is_tagged_oci(download_url) {
                state.bind_url(identity, download_url);
            }
            path
        };
        if let Some(path) = &found {
            debug!(url = %download_url, path = %path.display(), "module cache hit on resolved digest");
        }
        found
    }

    /// Persist validated `bytes` for `identity` and index them.
    ///
    /// An already indexed identity is only touched; its file is not
    /// rewritten. A failed write leaves the index unchanged. While the write
    /// is in flight, sweeps keep the file even if every indexed entry for
    /// the checksum expires.
    pub async fn insert(
        &self,
        identity: &ModuleIdentity,
        bytes: &[u8],
        download_url: &str,
    ) -> CacheResult<PathBuf> {
        let tagged = is_tagged_oci(download_url);

        let pending = match self.reserve(identity, download_url, tagged) {
            Slot::Cached(path) => {
                debug!(url = %download_url, checksum = %identity.checksum, "module already cached");
                return Ok(path);
            }
            Slot::Reserved(pending) => pending,
        };

        let path = self.path_for(&identity.checksum);
        io::write_atomic(&path, bytes).await?;

        let (path, count, created) = {
            let mut state = self.lock();
            let created = !state.entries.contains_key(identity);
            if created {
                state.entries.insert(
                    identity.clone(),
                    CacheEntry {
                        path: path.clone(),
                        last_touched: Instant::now(),
                        referencing_urls: HashSet::new(),
                    },
                );
            }
            let entry_path = match state.entries.get_mut(identity) {
                Some(entry) => {
                    entry.last_touched = Instant::now();
                    entry.path.clone()
                }
                None => path,
            };
            if tagged {
                state.bind_url(identity, download_url);
            }
            (entry_path, state.entries.len(), created)
        };
        drop(pending);

        if created {
            info!(
                url = %download_url,
                checksum = %identity.checksum,
                path = %path.display(),
                "cached module"
            );
        }
        self.observer.entries(count);
        Ok(path)
    }

    /// Touch an indexed `identity`, or mark its file as being written.
    fn reserve(&self, identity: &ModuleIdentity, download_url: &str, tagged: bool) -> Slot<'_> {
        let mut state = self.lock();
        let existing = state.entries.get_mut(identity).map(|entry| {
            entry.last_touched = Instant::now();
            entry.path.clone()
        });
        if let Some(path) = existing {
            if tagged {
                state.bind_url(identity, download_url);
            }
            return Slot::Cached(path);
        }
        *state.writing.entry(identity.checksum.clone()).or_insert(0) += 1;
        Slot::Reserved(PendingWrite {
            store: self,
            checksum: identity.checksum.clone(),
        })
    }

    /// Checksum the shortcut map currently holds for `url`.
    pub fn shortcut(&self, url: &str) -> Option<String> {
        self.lock().checksums.get(url).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // Every critical section leaves both maps consistent, so a poisoned
        // lock still guards valid state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
