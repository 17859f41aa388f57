use std::fmt::Write as _;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::config::{WatcherConfig, FILES_WATCHER, GHCI_WATCHER, OSC_WATCHER};

/// Runtime counters of the watcher service. Held in memory only.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceStats {
    pub total_executions: u64,
    pub total_commits: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<DateTime<Local>>,
    /// Number of watchers enabled in the configuration.
    pub active_watchers: usize,
    pub running: bool,
}

impl ServiceStats {
    /// One-line summary used by the periodic status log.
    pub fn summary(&self) -> String {
        format!("{} executions, {} commits", self.total_executions, self.total_commits)
    }
}

/// Human-readable description of a known watcher.
pub struct WatcherInfo {
    pub name: &'static str,
    pub language: &'static str,
    pub environment: &'static str,
    pub description: &'static str,
}

pub const KNOWN_WATCHERS: [WatcherInfo; 3] = [
    WatcherInfo {
        name: OSC_WATCHER,
        language: "sonicpi",
        environment: "sonic-pi",
        description: "Monitors Sonic Pi OSC messages for execution events",
    },
    WatcherInfo {
        name: FILES_WATCHER,
        language: "sonicpi",
        environment: "sonic-pi-files",
        description: "Watches Sonic Pi workspace files for changes",
    },
    WatcherInfo {
        name: GHCI_WATCHER,
        language: "tidal",
        environment: "tidal-cycles",
        description: "Monitors TidalCycles through GHCi interaction",
    },
];

/// Renders the `--status` report.
pub fn render_status(stats: &ServiceStats, enabled: &[String]) -> String {
    let mut out = String::from("Watcher Service Status:\n\n");
    let _ = writeln!(out, "  Running: {}", stats.running);
    let _ = writeln!(out, "  Active Watchers: {}", stats.active_watchers);
    let _ = writeln!(out, "  Total Executions: {}", stats.total_executions);
    let _ = writeln!(out, "  Total Commits: {}", stats.total_commits);
    if let Some(last) = stats.last_execution {
        let _ = writeln!(out, "  Last Execution: {}", last.format("%Y-%m-%d %H:%M:%S"));
    }

    out.push_str("\nEnabled Watchers:\n");
    for name in enabled {
        let _ = writeln!(out, "  - {name}");
    }
    out
}

/// Renders the `--list` report. `lookup` returns the stored config of a watcher.
pub fn render_watcher_list(
    enabled: &[String],
    lookup: impl Fn(&str) -> Option<WatcherConfig>,
) -> String {
    let mut out = String::from("Available Watchers:\n\n");
    for info in &KNOWN_WATCHERS {
        let state = if enabled.iter().any(|n| n == info.name) { "enabled" } else { "disabled" };
        let _ = writeln!(out, "  {} ({state})", info.name);
        let _ = writeln!(out, "    Language: {}", info.language);
        let _ = writeln!(out, "    Environment: {}", info.environment);
        let _ = writeln!(out, "    Description: {}", info.description);

        if let Some(config) = lookup(info.name) {
            out.push_str("    Options:\n");
            for (key, value) in &config.options {
                let _ = writeln!(out, "      {key}: {value}");
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // ── ServiceStats ──────────────────────────────────────────────────────────

    #[test]
    fn default_stats_are_zero() {
        let s = ServiceStats::default();
        assert_eq!(s.total_executions, 0);
        assert_eq!(s.total_commits, 0);
        assert!(s.last_execution.is_none());
        assert!(!s.running);
    }

    #[test]
    fn summary_reports_both_counters() {
        let s = ServiceStats { total_executions: 7, total_commits: 5, ..Default::default() };
        assert_eq!(s.summary(), "7 executions, 5 commits");
    }

    #[test]
    fn serializes_without_unset_timestamp() {
        let json = serde_json::to_string(&ServiceStats::default()).unwrap();
        assert!(json.contains("\"total_executions\":0"));
        assert!(!json.contains("last_execution"));
    }

    // ── render_status ─────────────────────────────────────────────────────────

    #[test]
    fn status_report_lists_counters_and_enabled_watchers() {
        let stats = ServiceStats {
            total_executions: 3,
            total_commits: 2,
            last_execution: Some(Local.with_ymd_and_hms(2024, 5, 1, 21, 30, 5).unwrap()),
            active_watchers: 1,
            running: true,
        };
        let report = render_status(&stats, &["tidal-ghci".to_string()]);
        assert!(report.contains("Running: true"));
        assert!(report.contains("Total Executions: 3"));
        assert!(report.contains("Total Commits: 2"));
        assert!(report.contains("Last Execution: 2024-05-01 21:30:05"));
        assert!(report.contains("  - tidal-ghci"));
    }

    #[test]
    fn status_report_omits_missing_last_execution() {
        let report = render_status(&ServiceStats::default(), &[]);
        assert!(!report.contains("Last Execution"));
    }

    // ── render_watcher_list ───────────────────────────────────────────────────

    #[test]
    fn list_marks_enabled_watchers_and_prints_options() {
        let enabled = vec![OSC_WATCHER.to_string()];
        let report = render_watcher_list(&enabled, |name| {
            (name == OSC_WATCHER).then(|| {
                WatcherConfig::new("sonicpi", "sonic-pi", &[("osc_port", "4559")])
            })
        });
        assert!(report.contains("sonicpi-osc (enabled)"));
        assert!(report.contains("sonicpi-files (disabled)"));
        assert!(report.contains("tidal-ghci (disabled)"));
        assert!(report.contains("      osc_port: 4559"));
        assert_eq!(report.matches("Options:").count(), 1);
    }
}
