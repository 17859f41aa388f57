use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const OSC_WATCHER: &str = "sonicpi-osc";
pub const FILES_WATCHER: &str = "sonicpi-files";
pub const GHCI_WATCHER: &str = "tidal-ghci";

pub const DEFAULT_OSC_PORT: u16 = 4559;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_GHCI_COMMAND: &str = "ghci";
pub const DEFAULT_BOOT_FILE: &str = "BootTidal.hs";
pub const DEFAULT_COMMIT_MESSAGE: &str = "Auto-commit: {{.Language}} execution in {{.Buffer}}";

/// Verbosity of the daemon's log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ConfigError::InvalidLogLevel(other.to_string())),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings for one named watcher. `options` keys are watcher-specific
/// (`osc_port`, `workspace_path`, `poll_interval`, `ghci_command`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WatcherConfig {
    pub language: String,
    pub environment: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl WatcherConfig {
    pub fn new(language: &str, environment: &str, options: &[(&str, &str)]) -> Self {
        Self {
            language: language.to_string(),
            environment: environment.to_string(),
            enabled: false,
            options: options
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

/// Root configuration structure, persisted as JSON (by default at
/// `~/.livecodegit/watchers.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_watchers")]
    pub watchers: BTreeMap<String, WatcherConfig>,
    #[serde(default = "default_language")]
    pub default_language: String,
    #[serde(default = "default_auto_commit")]
    pub auto_commit: bool,
    /// Template with `{{.Language}}`, `{{.Environment}}`, `{{.Buffer}}`,
    /// `{{.Timestamp}}` and `{{.Success}}` placeholders.
    #[serde(default = "default_commit_message")]
    pub commit_message: String,
    #[serde(default)]
    pub workspace_path: String,
    /// Kept as text so that a bad value surfaces from validation rather than
    /// from parsing.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            watchers: default_watchers(),
            default_language: default_language(),
            auto_commit: default_auto_commit(),
            commit_message: default_commit_message(),
            workspace_path: String::new(),
            log_level: default_log_level(),
        }
    }
}

impl GlobalConfig {
    /// Parsed log level, falling back to `info` for unrecognised values.
    pub fn log_level(&self) -> LogLevel {
        self.log_level.parse().unwrap_or_default()
    }
}

/// Owns the [`GlobalConfig`] and its backing file.
///
/// All mutation is in memory; nothing reaches disk until [`ConfigManager::save`].
#[derive(Debug)]
pub struct ConfigManager {
    path: PathBuf,
    config: RwLock<GlobalConfig>,
}

impl ConfigManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            config: RwLock::new(GlobalConfig::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the config file, writing the defaults out first if it does not exist.
    pub fn load(&self) -> Result<(), ConfigError> {
        if !self.path.exists() {
            tracing::info!(target: "config", path = %self.path.display(), "writing default watcher config");
            return self.save();
        }
        let content = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;
        let parsed: GlobalConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            })?;
        *self.config.write() = parsed;
        Ok(())
    }

    /// Writes the full config, creating the parent directory if needed.
    pub fn save(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let data =
            serde_json::to_string_pretty(&*self.config.read()).map_err(ConfigError::Serialize)?;
        std::fs::write(&self.path, data).map_err(|source| ConfigError::Write {
            path: self.path.clone(),
            source,
        })
    }

    pub fn config(&self) -> GlobalConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: GlobalConfig) {
        *self.config.write() = config;
    }

    pub fn watcher_config(&self, name: &str) -> Option<WatcherConfig> {
        self.config.read().watchers.get(name).cloned()
    }

    /// Inserts or replaces the config for `name`.
    pub fn set_watcher_config(&self, name: &str, config: WatcherConfig) {
        self.config.write().watchers.insert(name.to_string(), config);
    }

    pub fn enable_watcher(&self, name: &str) -> Result<(), ConfigError> {
        self.with_watcher(name, |w| w.enabled = true)
    }

    pub fn disable_watcher(&self, name: &str) -> Result<(), ConfigError> {
        self.with_watcher(name, |w| w.enabled = false)
    }

    pub fn set_watcher_option(&self, name: &str, key: &str, value: &str) -> Result<(), ConfigError> {
        self.with_watcher(name, |w| {
            w.options.insert(key.to_string(), value.to_string());
        })
    }

    /// All configured watcher names, sorted.
    pub fn list_watchers(&self) -> Vec<String> {
        self.config.read().watchers.keys().cloned().collect()
    }

    /// Names of enabled watchers, sorted.
    pub fn enabled_watchers(&self) -> Vec<String> {
        self.config
            .read()
            .watchers
            .iter()
            .filter(|(_, w)| w.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_config(&self.config.read())
    }

    fn with_watcher(
        &self,
        name: &str,
        f: impl FnOnce(&mut WatcherConfig),
    ) -> Result<(), ConfigError> {
        let mut config = self.config.write();
        let watcher = config
            .watchers
            .get_mut(name)
            .ok_or_else(|| ConfigError::WatcherNotFound(name.to_string()))?;
        f(watcher);
        Ok(())
    }
}

/// Checks the log level, the required fields of every watcher and the
/// type-specific options of the known watchers.
pub fn validate_config(config: &GlobalConfig) -> Result<(), ConfigError> {
    config.log_level.parse::<LogLevel>()?;
    for (name, watcher) in &config.watchers {
        validate_watcher(name, watcher).map_err(|reason| ConfigError::InvalidWatcher {
            watcher: name.clone(),
            reason,
        })?;
    }
    Ok(())
}

fn validate_watcher(name: &str, config: &WatcherConfig) -> Result<(), String> {
    if config.language.is_empty() {
        return Err("language is required".into());
    }
    if config.environment.is_empty() {
        return Err("environment is required".into());
    }

    match name {
        OSC_WATCHER => {
            if let Some(port) = config.option("osc_port") {
                if port.is_empty() {
                    return Err("osc_port cannot be empty".into());
                }
                port.parse::<u16>()
                    .map_err(|_| format!("osc_port is not a valid port: {port}"))?;
            }
        }
        FILES_WATCHER => {
            if let Some(path) = config.option("workspace_path").filter(|p| !p.is_empty()) {
                if !Path::new(path).exists() {
                    return Err(format!("workspace_path does not exist: {path}"));
                }
            }
            if let Some(interval) = config.option("poll_interval") {
                parse_duration(interval)
                    .ok_or_else(|| format!("poll_interval is not a duration: {interval}"))?;
            }
        }
        GHCI_WATCHER => {
            if config.option("ghci_command") == Some("") {
                return Err("ghci_command cannot be empty".into());
            }
        }
        _ => {}
    }
    Ok(())
}

/// Parses short durations such as `500ms`, `1s`, `1.5s` or `2m`. Zero and
/// out-of-range values are rejected.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    let split = text.find(|c: char| c.is_ascii_alphabetic())?;
    let (value, unit) = text.split_at(split);
    let value: f64 = value.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let secs = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return None,
    };
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero())
}

/// Formats a duration the way [`parse_duration`] reads it back.
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() != 0 || d.as_secs() == 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

fn default_watchers() -> BTreeMap<String, WatcherConfig> {
    let port = DEFAULT_OSC_PORT.to_string();
    BTreeMap::from([
        (
            OSC_WATCHER.to_string(),
            WatcherConfig::new(
                "sonicpi",
                "sonic-pi",
                &[("osc_port", port.as_str()), ("workspace_path", "")],
            ),
        ),
        (
            FILES_WATCHER.to_string(),
            WatcherConfig::new(
                "sonicpi",
                "sonic-pi-files",
                &[("workspace_path", ""), ("poll_interval", "1s")],
            ),
        ),
        (
            GHCI_WATCHER.to_string(),
            WatcherConfig::new(
                "tidal",
                "tidal-cycles",
                &[("ghci_command", DEFAULT_GHCI_COMMAND), ("boot_file", DEFAULT_BOOT_FILE)],
            ),
        ),
    ])
}

fn default_language() -> String {
    "sonicpi".to_string()
}

fn default_auto_commit() -> bool {
    true
}

fn default_commit_message() -> String {
    DEFAULT_COMMIT_MESSAGE.to_string()
}

fn default_log_level() -> String {
    LogLevel::default().as_str().to_string()
}
