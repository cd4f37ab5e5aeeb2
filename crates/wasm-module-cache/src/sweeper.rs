//! Background eviction task.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};
use crate::store::ModuleStore;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Periodically purges expired entries from a [`ModuleStore`].
///
/// The task stops when [`stop`](Self::stop) is called or the handle is
/// dropped. A sweep already running is allowed to finish.
#[derive(Debug)]
pub struct Sweeper {
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    /// Spawn the sweep loop on the current tokio runtime.
    ///
    /// `interval` is clamped to at least one millisecond.
    pub fn spawn(store: Arc<ModuleStore>, interval: Duration) -> CacheResult<Self> {
        let interval = interval.max(MIN_INTERVAL);
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| CacheError::Config {
            message: format!("module cache requires a tokio runtime: {}", e),
        })?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = runtime.spawn(run(store, interval, stop_rx));

        Ok(Self {
            stop_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Signal the loop to stop before its next tick. Idempotent.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "module cache sweeper exited abnormally");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(store: Arc<ModuleStore>, interval: Duration, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(interval = ?interval, expiry = ?store.expiry(), "module cache sweeper started");

    loop {
        tokio::select! {
            biased;
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let store = store.clone();
                let sweep = tokio::task::spawn_blocking(move || {
                    store.sweep(std::time::Instant::now())
                });
                match sweep.await {
                    Ok(report) => debug!(
                        evicted = report.evicted,
                        failed = report.failed,
                        remaining = report.remaining,
                        "module cache sweep finished"
                    ),
                    Err(e) => warn!(error = %e, "module cache sweep panicked"),
                }
            }
        }
    }

    debug!("module cache sweeper stopped");
}
