//! Polls a Sonic Pi workspace directory for modified buffer files.
//!
//! The first scan only records modification times. Every later tick emits one
//! event per known file whose modification time moved forward; files that
//! appear between ticks are recorded silently and reported from their next
//! change onwards.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use regex::RegexSet;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{stop_signal, stopped, EventCallback, ExecutionWatcher};
use crate::config::{format_duration, parse_duration, WatcherConfig, DEFAULT_POLL_INTERVAL};
use crate::error::WatchError;
use crate::event::ExecutionEvent;

const LANGUAGE: &str = "sonicpi";
const ENVIRONMENT: &str = "sonic-pi-files";
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

fn workspace_files() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([r"^workspace_\d+$", r"^buffer_\d+$", r"\.rb$", r"\.sonic$"])
            .expect("static regex set")
    })
}

/// True for Sonic Pi buffer files: `workspace_<n>`, `buffer_<n>`, `*.rb`, `*.sonic`.
pub fn is_workspace_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| workspace_files().is_match(name))
}

/// Buffer name for a file: the file name, without `.rb` for Ruby sources.
pub fn buffer_name(file_name: &str) -> String {
    file_name
        .strip_suffix(".rb")
        .unwrap_or(file_name)
        .to_string()
}

struct Running {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct FileWatcher {
    config: Mutex<WatcherConfig>,
    workspace_path: PathBuf,
    poll_interval: Mutex<Duration>,
    running: Mutex<Option<Running>>,
}

impl FileWatcher {
    pub fn new(workspace_path: impl Into<PathBuf>) -> Self {
        let workspace_path = workspace_path.into();
        let path_text = workspace_path.to_string_lossy().into_owned();
        let interval_text = format_duration(DEFAULT_POLL_INTERVAL);
        let mut config = WatcherConfig::new(
            LANGUAGE,
            ENVIRONMENT,
            &[("workspace_path", path_text.as_str()), ("poll_interval", interval_text.as_str())],
        );
        config.enabled = true;
        Self {
            config: Mutex::new(config),
            workspace_path,
            poll_interval: Mutex::new(DEFAULT_POLL_INTERVAL),
            running: Mutex::new(None),
        }
    }

    /// Builds a watcher from its config entry. Returns `None` when no
    /// workspace path is configured.
    pub fn from_config(config: &WatcherConfig) -> Option<Self> {
        let path = config.option("workspace_path").filter(|p| !p.is_empty())?;
        let watcher = Self::new(path);
        if let Some(interval) = config.option("poll_interval").and_then(parse_duration) {
            watcher.set_poll_interval(interval);
        }
        watcher.config.lock().enabled = config.enabled;
        Some(watcher)
    }

    /// Changes the polling interval. Takes effect on the next start. Values
    /// below 10ms are raised to 10ms.
    pub fn set_poll_interval(&self, interval: Duration) {
        let interval = interval.max(MIN_POLL_INTERVAL);
        *self.poll_interval.lock() = interval;
        self.config
            .lock()
            .options
            .insert("poll_interval".to_string(), format_duration(interval));
    }

    pub fn poll_interval(&self) -> Duration {
        *self.poll_interval.lock()
    }
}

#[async_trait]
impl ExecutionWatcher for FileWatcher {
    async fn start(&self, callback: EventCallback) -> Result<(), WatchError> {
        if self.is_running() {
            return Err(WatchError::AlreadyRunning { watcher: "file" });
        }
        if !self.workspace_path.exists() {
            return Err(WatchError::MissingWorkspace { path: self.workspace_path.clone() });
        }

        let mut poller = Poller::new(self.workspace_path.clone());
        let poller = tokio::task::spawn_blocking(move || {
            poller.scan();
            poller
        })
        .await
        .map_err(|e| WatchError::Scan(e.to_string()))?;
        debug!(
            target: "files",
            path = %self.workspace_path.display(),
            files = poller.known_files(),
            "watching workspace"
        );

        // Re-checked now that the baseline scan is done.
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(WatchError::AlreadyRunning { watcher: "file" });
        }
        let (stop_tx, stop_rx) = stop_signal();
        let period = self.poll_interval();
        let task = tokio::spawn(poller.run(period, callback, stop_rx));
        *running = Some(Running { stop_tx, task });
        Ok(())
    }

    async fn stop(&self) -> Result<(), WatchError> {
        let run = self.running.lock().take();
        let Some(run) = run else {
            return Ok(());
        };
        let _ = run.stop_tx.send(true);
        if let Err(e) = run.task.await {
            warn!(target: "files", "poll task ended abnormally: {e}");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    fn config(&self) -> WatcherConfig {
        self.config.lock().clone()
    }

    fn language(&self) -> &str {
        LANGUAGE
    }

    fn environment(&self) -> &str {
        ENVIRONMENT
    }
}

/// Modification-time bookkeeping for one run of the watcher.
struct Poller {
    root: PathBuf,
    last_modified: HashMap<PathBuf, SystemTime>,
}

impl Poller {
    fn new(root: PathBuf) -> Self {
        Self { root, last_modified: HashMap::new() }
    }

    fn known_files(&self) -> usize {
        self.last_modified.len()
    }

    async fn run(self, period: Duration, callback: EventCallback, mut stop_rx: watch::Receiver<bool>) {
        let root = self.root.clone();
        let poller = Arc::new(Mutex::new(self));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stopped(&mut stop_rx) => break,
                _ = ticker.tick() => {
                    let scanning = Arc::clone(&poller);
                    let events = match tokio::task::spawn_blocking(move || scanning.lock().scan()).await {
                        Ok(events) => events,
                        Err(e) => {
                            warn!(target: "files", "workspace scan failed: {e}");
                            break;
                        }
                    };
                    for event in events {
                        if *stop_rx.borrow() {
                            break;
                        }
                        callback(event);
                    }
                }
            }
        }
        debug!(target: "files", root = %root.display(), "poller stopped");
    }

    /// Walks the workspace and returns one event per previously known file
    /// whose modification time advanced.
    fn scan(&mut self) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        for entry in WalkDir::new(&self.root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() || !is_workspace_file(entry.path()) {
                continue;
            }
            let Some(modified) = entry.metadata().ok().and_then(|m| m.modified().ok()) else {
                continue;
            };

            match self.last_modified.get(entry.path()).copied() {
                None => {
                    self.last_modified.insert(entry.path().to_path_buf(), modified);
                }
                Some(previous) if modified > previous => {
                    self.last_modified.insert(entry.path().to_path_buf(), modified);
                    events.push(change_event(entry.path(), modified));
                }
                Some(_) => {}
            }
        }
        events
    }
}

fn change_event(path: &Path, modified: SystemTime) -> ExecutionEvent {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let timestamp: DateTime<Local> = modified.into();

    let mut event = match std::fs::read_to_string(path) {
        Ok(content) => {
            ExecutionEvent::new(timestamp, content, buffer_name(&file_name), LANGUAGE, ENVIRONMENT)
        }
        Err(e) => ExecutionEvent::new(
            timestamp,
            format!("# Error reading file: {}", path.display()),
            buffer_name(&file_name),
            LANGUAGE,
            ENVIRONMENT,
        )
        .failed(format!("Failed to read file: {e}")),
    };
    event.file_path = Some(path.to_path_buf());
    event.extra_data = HashMap::from([
        ("file_name".to_string(), file_name),
        ("trigger_type".to_string(), "file_change".to_string()),
    ]);
    event
}
