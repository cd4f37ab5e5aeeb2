//! Expiry sweep over the store.

use std::io::ErrorKind;
use std::time::Instant;

use tracing::{info, warn};

use super::ModuleStore;
use crate::key::ModuleIdentity;

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries removed from the index.
    pub evicted: usize,
    /// Entries whose file could not be deleted; retried next sweep.
    pub failed: usize,
    /// Entries left in the index.
    pub remaining: usize,
}

impl ModuleStore {
    /// Evict every entry untouched for longer than the expiry, as of `now`.
    ///
    /// Runs entirely under the store lock. An entry whose file cannot be
    /// deleted stays indexed. A file shared with a live entry of another
    /// name, or being written by a pending insert, is kept. A shortcut is dropped only while it still points at the
    /// evicted checksum.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        {
            let mut state = self.lock();

            let expired: Vec<ModuleIdentity> = state
                .entries
                .iter()
                .filter(|(_, entry)| now.saturating_duration_since(entry.last_touched) > self.expiry)
                .map(|(key, _)| key.clone())
                .collect();

            for key in expired {
                let Some(path) = state.entries.get(&key).map(|e| e.path.clone()) else {
                    continue;
                };

                let shared = state.is_writing(&key.checksum)
                    || state
                        .entries
                        .iter()
                        .any(|(other, entry)| other != &key && entry.path == path);

                if !shared {
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => {
                            warn!(
                                path = %path.display(),
                                error = %e,
                                "failed to delete expired module, retrying next sweep"
                            );
                            report.failed += 1;
                            continue;
                        }
                    }
                }

                if let Some(entry) = state.entries.remove(&key) {
                    for url in entry.referencing_urls {
                        if state.checksums.get(&url) == Some(&key.checksum) {
                            state.checksums.remove(&url);
                        }
                    }
                }
                info!(name = %key.name, checksum = %key.checksum, "evicted expired module");
                report.evicted += 1;
            }

            report.remaining = state.entries.len();
        }

        if report.evicted > 0 {
            self.observer.entries(report.remaining);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{create_test_store, HEX_A, HEX_B};
    use super::*;
    use crate::key::LookupRequest;
    use crate::validate::tests::MODULE;
    use std::time::Duration;

    fn past_expiry(store: &ModuleStore) -> Instant {
        Instant::now() + store.expiry() + Duration::from_secs(1)
    }

    #[tokio::test]
    async fn test_fresh_entry_survives() {
        let (store, _temp_dir) = create_test_store();
        let url = "https://x/mod.wasm";
        store
            .insert(&ModuleIdentity::for_url(url, HEX_A), MODULE, url)
            .await
            .unwrap();

        let report = store.sweep(Instant::now());
        assert_eq!(report.evicted, 0);
        assert_eq!(report.remaining, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_and_file_removed() {
        let (store, _temp_dir) = create_test_store();
        let url = "https://x/mod.wasm";
        let path = store
            .insert(&ModuleIdentity::for_url(url, HEX_A), MODULE, url)
            .await
            .unwrap();

        let report = store.sweep(past_expiry(&store));

        assert_eq!(report.evicted, 1);
        assert!(store.is_empty());
        assert!(!path.exists());
        assert!(store.lookup(&LookupRequest::new(url, HEX_A)).is_none());
    }

    #[tokio::test]
    async fn test_touch_resets_expiry() {
        let (store, _temp_dir) = create_test_store();
        let url = "https://x/mod.wasm";
        store
            .insert(&ModuleIdentity::for_url(url, HEX_A), MODULE, url)
            .await
            .unwrap();

        // Just inside the window measured from the lookup, just outside it
        // measured from the insert.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let touched_at = Instant::now();
        assert!(store.lookup(&LookupRequest::new(url, HEX_A)).is_some());
        let tick = touched_at + store.expiry();

        let report = store.sweep(tick);
        assert_eq!(report.evicted, 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_eviction_drops_shortcut() {
        let (store, _temp_dir) = create_test_store();
        let url = "oci://ghcr.io/org/filter:v1";
        store
            .insert(&ModuleIdentity::for_url(url, HEX_A), MODULE, url)
            .await
            .unwrap();
        assert!(store.shortcut(url).is_some());

        store.sweep(past_expiry(&store));

        assert_eq!(store.shortcut(url), None);
        assert!(store.lookup(&LookupRequest::new(url, "")).is_none());
    }

    #[tokio::test]
    async fn test_eviction_keeps_shortcut_rebound_to_newer_digest() {
        let (store, _temp_dir) = create_test_store();
        let url = "oci://ghcr.io/org/filter:latest";

        store
            .insert(&ModuleIdentity::for_url(url, HEX_A), MODULE, url)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let newer_at = Instant::now();
        store
            .insert(&ModuleIdentity::for_url(url, HEX_B), MODULE, url)
            .await
            .unwrap();
        assert_eq!(store.shortcut(url).as_deref(), Some(HEX_B));

        // Only the HEX_A entry is past expiry at this instant.
        let report = store.sweep(newer_at + store.expiry());
        assert_eq!(report.evicted, 1);

        assert_eq!(store.shortcut(url).as_deref(), Some(HEX_B));
        assert!(store.lookup(&LookupRequest::new(url, "")).is_some());
    }

    #[tokio::test]
    async fn test_shared_file_kept_while_other_name_live() {
        let (store, _temp_dir) = create_test_store();
        let old_url = "https://mirror-a/mod.wasm";
        let new_url = "https://mirror-b/mod.wasm";

        let path = store
            .insert(&ModuleIdentity::for_url(old_url, HEX_A), MODULE, old_url)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let newer_at = Instant::now();
        store
            .insert(&ModuleIdentity::for_url(new_url, HEX_A), MODULE, new_url)
            .await
            .unwrap();

        let report = store.sweep(newer_at + store.expiry());
        assert_eq!(report.evicted, 1);
        assert!(path.exists());
        assert!(store
            .lookup(&LookupRequest::new(new_url, HEX_A))
            .is_some());
    }

    #[tokio::test]
    async fn test_file_kept_while_insert_for_same_checksum_pending() {
        let (store, _temp_dir) = create_test_store();
        let old_url = "https://mirror-a/mod.wasm";
        let new_url = "https://mirror-b/mod.wasm";
        let path = store
            .insert(&ModuleIdentity::for_url(old_url, HEX_A), MODULE, old_url)
            .await
            .unwrap();

        let new_identity = ModuleIdentity::for_url(new_url, HEX_A);
        let pending = match store.reserve(&new_identity, new_url, false) {
            super::super::Slot::Reserved(pending) => pending,
            super::super::Slot::Cached(_) => panic!("mirror-b is not indexed yet"),
        };

        let report = store.sweep(past_expiry(&store));
        assert_eq!(report.evicted, 1);
        assert!(path.exists());

        drop(pending);
        assert!(!store.lock().is_writing(HEX_A));
    }

    #[tokio::test]
    async fn test_missing_file_still_evicts() {
        let (store, _temp_dir) = create_test_store();
        let url = "https://x/mod.wasm";
        let path = store
            .insert(&ModuleIdentity::for_url(url, HEX_A), MODULE, url)
            .await
            .unwrap();
        std::fs::remove_file(&path).unwrap();

        let report = store.sweep(past_expiry(&store));
        assert_eq!(report.evicted, 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_undeletable_file_stays_indexed() {
        let (store, _temp_dir) = create_test_store();
        let url = "https://x/mod.wasm";
        let path = store
            .insert(&ModuleIdentity::for_url(url, HEX_A), MODULE, url)
            .await
            .unwrap();

        // remove_file fails on a non-empty directory.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir_all(path.join("blocker")).unwrap();

        let report = store.sweep(past_expiry(&store));
        assert_eq!(report.evicted, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(store.len(), 1);

        std::fs::remove_dir_all(&path).unwrap();
        let report = store.sweep(past_expiry(&store));
        assert_eq!(report.evicted, 1);
    }
}
