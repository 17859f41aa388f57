use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::WatchError;
use crate::watchers::{EventCallback, ExecutionWatcher};

/// Registry of named watchers sharing one event callback.
///
/// The registry is only locked long enough to snapshot it; watchers are
/// started and stopped outside the lock.
#[derive(Default)]
pub struct WatcherManager {
    watchers: RwLock<BTreeMap<String, Arc<dyn ExecutionWatcher>>>,
    callback: RwLock<Option<EventCallback>>,
    running: AtomicBool,
}

impl WatcherManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `watcher` under `name`, replacing any previous entry.
    pub fn register_watcher(&self, name: impl Into<String>, watcher: Arc<dyn ExecutionWatcher>) {
        self.watchers.write().insert(name.into(), watcher);
    }

    pub fn set_callback(&self, callback: EventCallback) {
        *self.callback.write() = Some(callback);
    }

    pub fn callback(&self) -> Option<EventCallback> {
        self.callback.read().clone()
    }

    /// Starts every registered watcher whose own config is enabled. Stops at
    /// the first failure.
    pub async fn start_all(&self) -> Result<(), WatchError> {
        let callback = self.callback().ok_or(WatchError::NoCallback)?;

        let mut started_any = false;
        for (name, watcher) in self.snapshot() {
            if !watcher.config().enabled {
                continue;
            }
            if let Err(e) = watcher.start(Arc::clone(&callback)).await {
                self.running.store(started_any, Ordering::SeqCst);
                return Err(WatchError::StartFailed { name, source: Box::new(e) });
            }
            info!(target: "manager", watcher = %name, "started");
            started_any = true;
        }

        self.running.store(started_any, Ordering::SeqCst);
        Ok(())
    }

    /// Stops every running watcher, carrying on past failures. Returns the
    /// last error seen.
    pub async fn stop_all(&self) -> Result<(), WatchError> {
        let mut last_error = None;
        for (name, watcher) in self.snapshot() {
            if !watcher.is_running() {
                continue;
            }
            match watcher.stop().await {
                Ok(()) => info!(target: "manager", watcher = %name, "stopped"),
                Err(e) => {
                    warn!(target: "manager", watcher = %name, "failed to stop: {e}");
                    last_error = Some(WatchError::StopFailed { name, source: Box::new(e) });
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        last_error.map_or(Ok(()), Err)
    }

    pub fn get_watcher(&self, name: &str) -> Option<Arc<dyn ExecutionWatcher>> {
        self.watchers.read().get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn list_watchers(&self) -> Vec<String> {
        self.watchers.read().keys().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn ExecutionWatcher>)> {
        self.watchers
            .read()
            .iter()
            .map(|(name, w)| (name.clone(), Arc::clone(w)))
            .collect()
    }
}
