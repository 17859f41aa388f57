//! Seam to the commit store that turns execution events into versioned commits.
//!
//! The full content-addressable store lives outside this crate; the watcher
//! service only needs [`CommitStore::commit`] and
//! [`CommitStore::current_performance`]. [`JournalStore`] is the small
//! append-only implementation the daemon binary writes to.
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::paths;

/// Performance details recorded with every commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitMetadata {
    pub buffer: String,
    pub language: String,
    #[serde(default)]
    pub bpm: f64,
    #[serde(default)]
    pub beats_from_start: i64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub environment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub timestamp: DateTime<Local>,
    pub message: String,
    pub author: String,
    pub content: String,
    pub metadata: CommitMetadata,
}

/// A bounded recording session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub id: String,
    pub name: String,
    pub start_time: DateTime<Local>,
    pub commit_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_commit: Option<String>,
}

pub trait CommitStore: Send + Sync {
    fn commit(
        &self,
        content: &str,
        message: &str,
        metadata: CommitMetadata,
    ) -> Result<CommitRecord, StoreError>;

    fn current_performance(&self) -> Option<Performance>;
}

#[derive(Debug, Default)]
struct JournalState {
    head: Option<String>,
    performance: Option<Performance>,
}

/// Appends one JSON line per commit to `<repo>/.livecodegit/journal.jsonl`.
#[derive(Debug)]
pub struct JournalStore {
    path: PathBuf,
    author: String,
    state: Mutex<JournalState>,
}

impl JournalStore {
    /// Creates the repository directory under `repo` if needed and opens it.
    pub fn init(repo: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(repo.join(paths::APP_DIR_NAME))?;
        Self::open(repo)
    }

    /// Opens an existing repository, restoring the head from the last journal line.
    pub fn open(repo: &Path) -> Result<Self, StoreError> {
        let dir = repo.join(paths::APP_DIR_NAME);
        if !dir.is_dir() {
            return Err(StoreError::NotInitialized { path: repo.to_path_buf() });
        }
        let path = paths::journal_file_path(repo);

        let mut head = None;
        if path.exists() {
            let reader = BufReader::new(std::fs::File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: CommitRecord = serde_json::from_str(&line)?;
                head = Some(record.hash);
            }
        }

        Ok(Self {
            path,
            author: std::env::var("USER").unwrap_or_else(|_| "livecoder".to_string()),
            state: Mutex::new(JournalState { head, performance: None }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn head(&self) -> Option<String> {
        self.state.lock().head.clone()
    }

    /// Starts a new performance; subsequent commits are counted against it.
    pub fn start_performance(&self, name: &str) -> Performance {
        let now = Local::now();
        let performance = Performance {
            id: short_hash(&format!("{name}{}", now.to_rfc3339())),
            name: name.to_string(),
            start_time: now,
            commit_count: 0,
            head_commit: None,
        };
        self.state.lock().performance = Some(performance.clone());
        performance
    }
}

impl CommitStore for JournalStore {
    fn commit(
        &self,
        content: &str,
        message: &str,
        metadata: CommitMetadata,
    ) -> Result<CommitRecord, StoreError> {
        let mut state = self.state.lock();
        let timestamp = Local::now();
        let record = CommitRecord {
            hash: full_hash(&format!("{content}{message}{}", timestamp.to_rfc3339())),
            parent: state.head.clone(),
            timestamp,
            message: message.to_string(),
            author: self.author.clone(),
            content: content.to_string(),
            metadata,
        };

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;

        state.head = Some(record.hash.clone());
        if let Some(performance) = state.performance.as_mut() {
            performance.commit_count += 1;
            performance.head_commit = Some(record.hash.clone());
        }
        Ok(record)
    }

    fn current_performance(&self) -> Option<Performance> {
        self.state.lock().performance.clone()
    }
}

fn full_hash(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

fn short_hash(input: &str) -> String {
    full_hash(input)[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> CommitMetadata {
        CommitMetadata {
            buffer: "workspace_1".into(),
            language: "sonicpi".into(),
            bpm: 120.0,
            beats_from_start: 8,
            success: true,
            error_message: None,
            environment: "sonic-pi".into(),
        }
    }

    #[test]
    fn open_uninitialized_repo_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            JournalStore::open(dir.path()),
            Err(StoreError::NotInitialized { .. })
        ));
    }

    #[test]
    fn commits_chain_parents_and_append_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::init(dir.path()).unwrap();

        let first = store.commit("play 60", "first", metadata()).unwrap();
        let second = store.commit("play 62", "second", metadata()).unwrap();

        assert!(first.parent.is_none());
        assert_eq!(second.parent.as_deref(), Some(first.hash.as_str()));
        assert_eq!(first.hash.len(), 64);
        assert_eq!(store.head(), Some(second.hash.clone()));

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn reopen_restores_head() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::init(dir.path()).unwrap();
        let record = store.commit("play 60", "first", metadata()).unwrap();
        drop(store);

        let reopened = JournalStore::open(dir.path()).unwrap();
        assert_eq!(reopened.head(), Some(record.hash));
    }

    #[test]
    fn performance_counts_commits() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::init(dir.path()).unwrap();
        assert!(store.current_performance().is_none());

        store.start_performance("friday set");
        let record = store.commit("play 60", "first", metadata()).unwrap();

        let performance = store.current_performance().unwrap();
        assert_eq!(performance.name, "friday set");
        assert_eq!(performance.commit_count, 1);
        assert_eq!(performance.head_commit, Some(record.hash));
    }
}
