//! Filesystem helpers for the store.

use std::path::Path;

use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use crate::error::{CacheError, CacheResult};

pub(crate) fn ensure_dir(dir: &Path) -> CacheResult<()> {
    std::fs::create_dir_all(dir).map_err(|e| CacheError::Config {
        message: format!("failed to create cache directory {}: {}", dir.display(), e),
    })
}

/// Write `bytes` to `path` via a uniquely named temp file in the same
/// directory, so concurrent writers never share a temp file and readers never
/// see a partial module.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> CacheResult<()> {
    let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

    fs::write(&temp_path, bytes)
        .await
        .map_err(|e| CacheError::persistence(&temp_path, format!("failed to write temp file: {}", e)))?;

    if let Err(e) = fs::rename(&temp_path, path).await {
        if let Err(cleanup) = fs::remove_file(&temp_path).await {
            warn!(path = %temp_path.display(), error = %cleanup, "failed to remove temp file");
        }
        return Err(CacheError::persistence(
            path,
            format!("failed to rename temp file: {}", e),
        ));
    }

    Ok(())
}
