//! Cache configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Allowlist entry that marks every registry as insecure.
pub const ALLOW_ALL_INSECURE: &str = "*";

/// Module cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding `<sha256>.wasm` files.
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// Seconds between eviction sweeps.
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,

    /// Seconds an entry may go untouched before it is evicted.
    #[serde(default = "default_module_expiry")]
    pub module_expiry_secs: u64,

    /// Registry hosts (`host` or `host:port`) contacted over plain HTTP.
    #[serde(default)]
    pub insecure_registries: Vec<String>,

    /// Retries for transient HTTP download failures. Off by default.
    #[serde(default)]
    pub http_max_retries: u32,
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("wasm-module-cache")
}

fn default_purge_interval() -> u64 {
    10 * 60
}

fn default_module_expiry() -> u64 {
    24 * 60 * 60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            purge_interval_secs: default_purge_interval(),
            module_expiry_secs: default_module_expiry(),
            insecure_registries: Vec::new(),
            http_max_retries: 0,
        }
    }
}

impl CacheConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `WASM_CACHE_DIR` | Cache directory |
    /// | `WASM_CACHE_PURGE_INTERVAL` | Seconds between eviction sweeps |
    /// | `WASM_CACHE_MODULE_EXPIRY` | Seconds before an untouched entry expires |
    /// | `WASM_INSECURE_REGISTRIES` | Comma separated hosts, `*` for all |
    /// | `WASM_HTTP_MAX_RETRIES` | Retries for transient HTTP failures |
    pub fn from_env() -> Self {
        Self {
            dir: std::env::var_os("WASM_CACHE_DIR")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(default_cache_dir),
            purge_interval_secs: env_parse("WASM_CACHE_PURGE_INTERVAL")
                .unwrap_or_else(default_purge_interval),
            module_expiry_secs: env_parse("WASM_CACHE_MODULE_EXPIRY")
                .unwrap_or_else(default_module_expiry),
            insecure_registries: std::env::var("WASM_INSECURE_REGISTRIES")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|h| !h.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            http_max_retries: env_parse("WASM_HTTP_MAX_RETRIES").unwrap_or(0),
        }
    }

    /// Set the cache directory.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Set the sweep interval, rounded up to whole seconds (at least one).
    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval_secs = ceil_secs(interval).max(1);
        self
    }

    /// Set the entry expiry, rounded up to whole seconds.
    ///
    /// Use [`ModuleCacheBuilder::with_module_expiry`](crate::ModuleCacheBuilder::with_module_expiry)
    /// for sub-second precision.
    pub fn with_module_expiry(mut self, expiry: Duration) -> Self {
        self.module_expiry_secs = ceil_secs(expiry);
        self
    }

    /// Allow plain-HTTP access to `host`.
    pub fn with_insecure_registry(mut self, host: impl Into<String>) -> Self {
        self.insecure_registries.push(host.into());
        self
    }

    pub fn with_http_max_retries(mut self, retries: u32) -> Self {
        self.http_max_retries = retries;
        self
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }

    pub fn module_expiry(&self) -> Duration {
        Duration::from_secs(self.module_expiry_secs)
    }

    /// Whether `host` is on the insecure-registry allowlist.
    ///
    /// An entry without a port matches the host on any port.
    pub fn is_insecure(&self, host: &str) -> bool {
        let bare = host.split(':').next().unwrap_or(host);
        self.insecure_registries
            .iter()
            .any(|entry| entry == ALLOW_ALL_INSECURE || entry == host || entry == bare)
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
