//! Watcher service: ties the watcher registry, the configuration and the
//! commit store together.
//!
//! Every detected execution flows through [`WatcherService::handle_execution_event`],
//! which updates the counters and, when auto-commit is on, turns the event into
//! a commit. The counters lock is never held while the store is called, and
//! inside a runtime the store call runs on the blocking pool so the detecting
//! loop never waits on it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Local};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::{
    ConfigManager, WatcherConfig, DEFAULT_COMMIT_MESSAGE, FILES_WATCHER, GHCI_WATCHER, OSC_WATCHER,
};
use crate::error::{ConfigError, WatchError};
use crate::event::ExecutionEvent;
use crate::manager::WatcherManager;
use crate::status::ServiceStats;
use crate::store::CommitStore;
use crate::template::MessageTemplate;
use crate::watchers::{ExecutionWatcher, FileWatcher, GhciWatcher, OscWatcher};

const PREVIEW_LEN: usize = 50;

#[derive(Debug, Default)]
struct Counters {
    total_executions: u64,
    total_commits: u64,
    last_execution: Option<DateTime<Local>>,
}

#[derive(Debug)]
struct CommitSettings {
    auto_commit: bool,
    template: Option<MessageTemplate>,
}

pub struct WatcherService {
    manager: WatcherManager,
    config: ConfigManager,
    store: Arc<dyn CommitStore>,
    counters: Arc<RwLock<Counters>>,
    settings: RwLock<CommitSettings>,
    running: AtomicBool,
    /// Serialises start/stop/disable against each other.
    lifecycle: tokio::sync::Mutex<()>,
}

impl WatcherService {
    /// Creates a service committing to `store`, with its configuration at
    /// `config_path`. Nothing is loaded until [`WatcherService::initialize`].
    pub fn new(store: Arc<dyn CommitStore>, config_path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let manager = WatcherManager::new();
            let handle = this.clone();
            manager.set_callback(Arc::new(move |event| {
                if let Some(service) = handle.upgrade() {
                    service.handle_execution_event(event);
                }
            }));

            Self {
                manager,
                config: ConfigManager::new(config_path),
                store,
                counters: Arc::new(RwLock::new(Counters::default())),
                settings: RwLock::new(CommitSettings {
                    auto_commit: true,
                    template: MessageTemplate::compile(DEFAULT_COMMIT_MESSAGE).ok(),
                }),
                running: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(()),
            }
        })
    }

    /// Loads and validates the configuration, compiles the commit template
    /// and registers one watcher per recognised name.
    pub fn initialize(&self) -> Result<(), ConfigError> {
        self.config.load()?;
        self.config.validate()?;

        let config = self.config.config();
        let template = MessageTemplate::compile(&config.commit_message)?;
        *self.settings.write() = CommitSettings {
            auto_commit: config.auto_commit,
            template: Some(template),
        };

        for (name, watcher_config) in &config.watchers {
            if let Some(watcher) = build_watcher(name, watcher_config) {
                debug!(target: "service", watcher = %name, "registered");
                self.manager.register_watcher(name.clone(), watcher);
            }
        }
        Ok(())
    }

    /// Starts every watcher enabled in the configuration. All of them are
    /// attempted; the service only counts as running if none failed.
    pub async fn start(&self) -> Result<(), WatchError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Err(WatchError::ServiceRunning);
        }
        let callback = self.manager.callback().ok_or(WatchError::NoCallback)?;

        let enabled = self.config.enabled_watchers();
        let mut failure = None;
        for name in &enabled {
            let Some(watcher) = self.manager.get_watcher(name) else {
                warn!(target: "service", watcher = %name, "enabled but not registered");
                continue;
            };
            if watcher.is_running() {
                continue;
            }
            match watcher.start(Arc::clone(&callback)).await {
                Ok(()) => info!(target: "service", watcher = %name, "started"),
                Err(e) => {
                    error!(target: "service", watcher = %name, "failed to start: {e}");
                    failure = Some(WatchError::StartFailed { name: name.clone(), source: Box::new(e) });
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        self.running.store(true, Ordering::SeqCst);
        info!(target: "service", "watcher service started with {} active watchers", enabled.len());
        Ok(())
    }

    /// Stops all running watchers. The service is marked stopped even when a
    /// watcher fails to stop.
    pub async fn stop(&self) -> Result<(), WatchError> {
        let _lifecycle = self.lifecycle.lock().await;
        let result = self.manager.stop_all().await;
        self.running.store(false, Ordering::SeqCst);
        info!(target: "service", "watcher service stopped");
        result
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Enables `name` and persists the configuration.
    pub fn enable_watcher(&self, name: &str) -> Result<(), ConfigError> {
        self.config.enable_watcher(name)?;
        self.config.save()
    }

    /// Disables `name`, stopping its live instance first when the service is
    /// running, and persists the configuration.
    pub async fn disable_watcher(&self, name: &str) -> Result<(), WatchError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            if let Some(watcher) = self.manager.get_watcher(name).filter(|w| w.is_running()) {
                watcher.stop().await.map_err(|e| WatchError::StopFailed {
                    name: name.to_string(),
                    source: Box::new(e),
                })?;
                info!(target: "service", watcher = %name, "stopped");
            }
        }
        self.config.disable_watcher(name)?;
        self.config.save()?;
        Ok(())
    }

    /// Counts the execution and, when auto-commit is on, commits it.
    /// Commit failures are logged and never reach the calling watcher. The
    /// commit counter is bumped once the store call succeeds, which may be
    /// after this returns.
    pub fn handle_execution_event(&self, event: ExecutionEvent) {
        {
            let mut counters = self.counters.write();
            counters.total_executions += 1;
            counters.last_execution = Some(event.timestamp);
        }

        info!(
            target: "service",
            "execution detected: {}/{} - {}",
            event.language,
            event.buffer,
            preview(&event.content)
        );

        let message = {
            let settings = self.settings.read();
            if !settings.auto_commit {
                return;
            }
            match &settings.template {
                Some(template) => template.render(&event),
                None => {
                    warn!(target: "service", "no commit message template compiled; skipping commit");
                    return;
                }
            }
        };

        let store = Arc::clone(&self.store);
        let counters = Arc::clone(&self.counters);
        let commit = move || auto_commit(store.as_ref(), &counters, &event, &message);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => drop(runtime.spawn_blocking(commit)),
            Err(_) => commit(),
        }
    }

    pub fn stats(&self) -> ServiceStats {
        let counters = self.counters.read();
        ServiceStats {
            total_executions: counters.total_executions,
            total_commits: counters.total_commits,
            last_execution: counters.last_execution,
            active_watchers: self.config.enabled_watchers().len(),
            running: self.is_running(),
        }
    }

    pub fn enabled_watchers(&self) -> Vec<String> {
        self.config.enabled_watchers()
    }

    pub fn watcher_config(&self, name: &str) -> Option<WatcherConfig> {
        self.config.watcher_config(name)
    }

    /// Replaces the stored config for `name` and persists it. Registered
    /// instances keep their construction-time settings.
    pub fn update_watcher_config(&self, name: &str, config: WatcherConfig) -> Result<(), ConfigError> {
        self.config.set_watcher_config(name, config);
        self.config.save()
    }

    pub fn manager(&self) -> &WatcherManager {
        &self.manager
    }
}

fn build_watcher(name: &str, config: &WatcherConfig) -> Option<Arc<dyn ExecutionWatcher>> {
    match name {
        OSC_WATCHER => Some(Arc::new(OscWatcher::from_config(config))),
        FILES_WATCHER => match FileWatcher::from_config(config) {
            Some(watcher) => Some(Arc::new(watcher)),
            None => {
                warn!(target: "service", watcher = %name, "workspace_path is required; skipping");
                None
            }
        },
        GHCI_WATCHER => Some(Arc::new(GhciWatcher::from_config(config))),
        _ => {
            warn!(target: "service", watcher = %name, "unknown watcher type; skipping");
            None
        }
    }
}

fn auto_commit(store: &dyn CommitStore, counters: &RwLock<Counters>, event: &ExecutionEvent, message: &str) {
    match store.commit(&event.content, message, event.to_metadata()) {
        Ok(record) => {
            counters.write().total_commits += 1;
            debug!(target: "service", hash = %record.hash, "auto-commit created");
        }
        Err(e) => warn!(target: "service", "failed to create auto-commit: {e}"),
    }
}

fn preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_LEN {
        return content.to_string();
    }
    let mut short: String = content.chars().take(PREVIEW_LEN - 3).collect();
    short.push_str("...");
    short
}
