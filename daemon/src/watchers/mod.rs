//! Execution watchers.
//!
//! Every watcher implements [`ExecutionWatcher`] and follows the same
//! lifecycle: `Stopped -> Running -> Stopped`. `start` stores the callback,
//! acquires the watcher's resources and launches its background loops;
//! `stop` signals the loops, waits for them to wind down and releases
//! everything they held. Loops observe the stop signal at every iteration.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::config::WatcherConfig;
use crate::error::WatchError;
use crate::event::ExecutionEvent;

pub mod files;
pub mod ghci;
pub mod osc;

pub use files::FileWatcher;
pub use ghci::GhciWatcher;
pub use osc::OscWatcher;

/// Shared sink for detected executions. Invoked from the watchers' background
/// tasks, possibly concurrently.
pub type EventCallback = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

#[async_trait]
pub trait ExecutionWatcher: Send + Sync {
    /// Begins watching. Fails if already running, leaving the running
    /// instance untouched.
    async fn start(&self, callback: EventCallback) -> Result<(), WatchError>;

    /// Stops watching. A no-op on a stopped watcher.
    async fn stop(&self) -> Result<(), WatchError>;

    fn is_running(&self) -> bool;

    fn config(&self) -> WatcherConfig;

    fn language(&self) -> &str;

    /// Environment name, e.g. `sonic-pi` or `tidal-cycles`.
    fn environment(&self) -> &str;
}

/// Creates a fresh stop signal for one run of a watcher.
pub(crate) fn stop_signal() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolves once stop has been requested or the sender is gone.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}
