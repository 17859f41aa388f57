//! Error types shared by the watchers, the config layer and the commit store.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from watcher lifecycle operations.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("{watcher} watcher is already running")]
    AlreadyRunning { watcher: &'static str },

    #[error("watcher is not running")]
    NotRunning,

    #[error("no callback function set")]
    NoCallback,

    #[error("failed to listen on UDP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to attach {stream} pipe")]
    Pipe { stream: &'static str },

    #[error("workspace path does not exist: {}", path.display())]
    MissingWorkspace { path: PathBuf },

    #[error("workspace scan failed: {0}")]
    Scan(String),

    #[error("failed to write to REPL stdin: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to start watcher {name}: {source}")]
    StartFailed {
        name: String,
        #[source]
        source: Box<WatchError>,
    },

    #[error("failed to stop watcher {name}: {source}")]
    StopFailed {
        name: String,
        #[source]
        source: Box<WatchError>,
    },

    #[error("watcher service is already running")]
    ServiceRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors from loading, saving and validating the watcher configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write config file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create config directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("watcher '{0}' not found")]
    WatcherNotFound(String),

    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("invalid config for watcher '{watcher}': {reason}")]
    InvalidWatcher { watcher: String, reason: String },

    #[error("invalid commit message template: {0}")]
    InvalidTemplate(String),
}

/// Errors raised by a [`CommitStore`](crate::store::CommitStore).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("commit store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode commit: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("commit store is not initialized at {}", path.display())]
    NotInitialized { path: PathBuf },
}
