//! Canonical file locations for the watcher daemon.
//!
//! Per-user files live under `~/.livecodegit/`:
//!   - watchers.json  Watcher configuration, shared with the CLI.
//!
//! Per-repository files live under `<repo>/.livecodegit/`:
//!   - journal.jsonl  Commits appended by the journal store.
use std::path::{Path, PathBuf};

pub const APP_DIR_NAME: &str = ".livecodegit";
pub const CONFIG_FILE_NAME: &str = "watchers.json";
pub const JOURNAL_FILE_NAME: &str = "journal.jsonl";

/// Returns the per-user data directory, or a relative `.livecodegit` when the
/// home directory cannot be determined.
pub fn app_data_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(APP_DIR_NAME),
        None => PathBuf::from(APP_DIR_NAME),
    }
}

/// Returns the default watcher config path: `~/.livecodegit/watchers.json`
pub fn config_file_path() -> PathBuf {
    app_data_dir().join(CONFIG_FILE_NAME)
}

/// Returns the journal path inside the repository rooted at `repo`.
pub fn journal_file_path(repo: &Path) -> PathBuf {
    repo.join(APP_DIR_NAME).join(JOURNAL_FILE_NAME)
}
