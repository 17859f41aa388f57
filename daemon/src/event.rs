use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::store::CommitMetadata;

/// A single detected code execution, produced by a watcher and handed to the
/// shared callback exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionEvent {
    pub timestamp: DateTime<Local>,
    /// Executed source, or a placeholder when the watcher cannot recover it.
    pub content: String,
    /// Buffer, workspace or connection the code ran in (e.g. `workspace_0`, `d1`).
    pub buffer: String,
    pub language: String,
    pub environment: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bpm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beats_from_start: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub extra_data: HashMap<String, String>,
}

impl ExecutionEvent {
    /// Builds a successful event with every optional field unset.
    pub fn new(
        timestamp: DateTime<Local>,
        content: impl Into<String>,
        buffer: impl Into<String>,
        language: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            content: content.into(),
            buffer: buffer.into(),
            language: language.into(),
            environment: environment.into(),
            success: true,
            error_message: None,
            bpm: None,
            beats_from_start: None,
            file_path: None,
            line_number: None,
            process_id: None,
            extra_data: HashMap::new(),
        }
    }

    /// Marks the event as failed with `message` as its error text.
    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(message.into());
        self
    }

    /// Label used by commit message templates.
    pub fn outcome_label(&self) -> &'static str {
        if self.success {
            "success"
        } else {
            "error"
        }
    }

    /// Projects the event onto the metadata stored alongside a commit.
    pub fn to_metadata(&self) -> CommitMetadata {
        CommitMetadata {
            buffer: self.buffer.clone(),
            language: self.language.clone(),
            bpm: self.bpm.unwrap_or_default(),
            beats_from_start: self.beats_from_start.unwrap_or_default(),
            success: self.success,
            error_message: self.error_message.clone(),
            environment: self.environment.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ExecutionEvent {
        ExecutionEvent::new(Local::now(), "play 60", "workspace_0", "sonicpi", "sonic-pi")
    }

    #[test]
    fn new_event_is_successful_with_no_optionals() {
        let e = sample();
        assert!(e.success);
        assert!(e.error_message.is_none());
        assert!(e.bpm.is_none());
        assert!(e.extra_data.is_empty());
        assert_eq!(e.outcome_label(), "success");
    }

    #[test]
    fn failed_sets_flag_and_message() {
        let e = sample().failed("syntax error");
        assert!(!e.success);
        assert_eq!(e.error_message.as_deref(), Some("syntax error"));
        assert_eq!(e.outcome_label(), "error");
    }

    #[test]
    fn to_metadata_copies_performance_fields() {
        let mut e = sample();
        e.bpm = Some(128.0);
        e.beats_from_start = Some(32);
        let m = e.to_metadata();
        assert_eq!(m.buffer, "workspace_0");
        assert_eq!(m.language, "sonicpi");
        assert_eq!(m.environment, "sonic-pi");
        assert_eq!(m.bpm, 128.0);
        assert_eq!(m.beats_from_start, 32);
        assert!(m.success);
    }

    #[test]
    fn to_metadata_defaults_missing_tempo_to_zero() {
        let m = sample().failed("boom").to_metadata();
        assert_eq!(m.bpm, 0.0);
        assert_eq!(m.beats_from_start, 0);
        assert_eq!(m.error_message.as_deref(), Some("boom"));
    }
}
