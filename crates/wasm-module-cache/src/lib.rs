//! Local cache for remotely referenced WebAssembly modules.
//!
//! Modules are downloaded over HTTP(S) or pulled from OCI registries, checked
//! against a caller-supplied SHA-256, validated as wasm binaries and stored
//! under their checksum in one flat directory:
//!
//! - Repeated requests are served from disk without network I/O
//! - Tag-based OCI references remember the digest they last resolved to
//! - Entries untouched for longer than the expiry are evicted in the background
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use wasm_module_cache::{CacheConfig, ModuleCache};
//!
//! # async fn example() -> wasm_module_cache::CacheResult<()> {
//! let cache = ModuleCache::new(CacheConfig::from_env())?;
//!
//! // Checksum-less: adopt whatever the URL serves now.
//! let path = cache
//!     .get("https://example.com/filter.wasm", "", Duration::from_secs(5), None)
//!     .await?;
//! println!("module at {}", path.display());
//!
//! // OCI image, pinned by manifest digest.
//! let path = cache
//!     .get(
//!         "oci://ghcr.io/org/filter:v1",
//!         "sha256:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae",
//!         Duration::from_secs(5),
//!         None,
//!     )
//!     .await?;
//! # let _ = path;
//! cache.cleanup();
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `WASM_CACHE_DIR` | Cache directory (default: platform cache dir + `wasm-module-cache`) |
//! | `WASM_CACHE_PURGE_INTERVAL` | Seconds between eviction sweeps (default: 600) |
//! | `WASM_CACHE_MODULE_EXPIRY` | Seconds an untouched module is kept (default: 86400) |
//! | `WASM_INSECURE_REGISTRIES` | Comma separated registries reached over plain HTTP, `*` for all |
//! | `WASM_HTTP_MAX_RETRIES` | Retries for transient HTTP failures (default: 0) |

pub mod cache;
pub mod config;
mod digest;
pub mod error;
pub mod key;
pub mod observer;
pub mod reference;
pub mod source;
pub mod store;
pub mod sweeper;
pub mod validate;

// Re-export main types
pub use cache::{ModuleCache, ModuleCacheBuilder};
pub use config::CacheConfig;
pub use digest::sha256_hex;
pub use error::{CacheError, CacheResult};
pub use key::{module_name, LookupRequest, ModuleIdentity};
pub use observer::{CacheObserver, FetchOutcome, NoopObserver};
pub use reference::ImageRef;
pub use source::{
    DeferredFetch, FetchContext, HttpSource, ModuleSource, OciSource, Payload, Resolved,
    SourceRegistry,
};
pub use store::{ModuleStore, SweepReport};
pub use sweeper::Sweeper;
pub use validate::{is_wasm, validate_module, WASM_MAGIC};
