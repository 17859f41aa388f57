//! TidalCycles watcher driving a GHCi subprocess.
//!
//! After a short startup delay the Tidal boot commands are written to the
//! REPL's stdin. Stdout lines mentioning a pattern (`d1 $` .. `d9 $`, `hush`,
//! `silence`) become successful events and `cps`/`bps` lines update the tempo;
//! every non-empty stderr line becomes a failed event.
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::{stop_signal, stopped, EventCallback, ExecutionWatcher};
use crate::config::{WatcherConfig, DEFAULT_BOOT_FILE, DEFAULT_GHCI_COMMAND};
use crate::error::WatchError;
use crate::event::ExecutionEvent;

const LANGUAGE: &str = "tidal";
const ENVIRONMENT: &str = "tidal-cycles";
pub const PROMPT: &str = "tidal>";
pub const DEFAULT_CPS: f64 = 0.5625;

const INIT_DELAY: Duration = Duration::from_secs(1);
const COMMAND_DELAY: Duration = Duration::from_millis(100);
/// How long `:quit` gets before the process is killed.
const QUIT_GRACE: Duration = Duration::from_millis(500);

const PATTERN_MARKERS: [&str; 11] = [
    "d1 $", "d2 $", "d3 $", "d4 $", "d5 $", "d6 $", "d7 $", "d8 $", "d9 $", "hush", "silence",
];

pub fn boot_commands() -> Vec<String> {
    [
        ":set -XOverloadedStrings",
        ":set prompt \"tidal> \"",
        "import Sound.Tidal.Context",
        "(cps, nudger, d1, d2, d3, d4, d5, d6, d7, d8, d9) <- dirtStream",
        "let bps x = cps (x/4)",
        "let hush = mapM_ ($ silence) [d1,d2,d3,d4,d5,d6,d7,d8,d9]",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn connection_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(d\d+)\b").expect("static regex"))
}

fn cps_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:cps|bps)\s*\(?\s*(\d+(?:\.\d+)?)\s*\)?").expect("static regex")
    })
}

/// Tempo and pattern state shared with the stream readers.
#[derive(Debug)]
struct ReplState {
    cps: f64,
    started_at: DateTime<Local>,
    pid: Option<u32>,
    last_patterns: HashMap<String, String>,
}

struct Session {
    child: Child,
    stdin: Arc<AsyncMutex<ChildStdin>>,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct GhciWatcher {
    config: WatcherConfig,
    program: String,
    args: Vec<String>,
    init_commands: Vec<String>,
    init_delay: Duration,
    command_delay: Duration,
    state: Arc<Mutex<ReplState>>,
    session: Mutex<Option<Session>>,
}

impl GhciWatcher {
    pub fn new() -> Self {
        let mut config = WatcherConfig::new(
            LANGUAGE,
            ENVIRONMENT,
            &[("ghci_command", DEFAULT_GHCI_COMMAND), ("boot_file", DEFAULT_BOOT_FILE)],
        );
        config.enabled = true;
        Self::with_command(config, DEFAULT_GHCI_COMMAND, Vec::new())
    }

    /// Builds a watcher from its config entry. `ghci_command` is split on
    /// whitespace into a program and its arguments.
    pub fn from_config(config: &WatcherConfig) -> Self {
        let command = config
            .option("ghci_command")
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(DEFAULT_GHCI_COMMAND);
        let mut parts = command.split_whitespace().map(String::from);
        let program = parts.next().unwrap_or_else(|| DEFAULT_GHCI_COMMAND.to_string());
        Self::with_command(config.clone(), program, parts.collect())
    }

    fn with_command(config: WatcherConfig, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            config,
            program: program.into(),
            args,
            init_commands: boot_commands(),
            init_delay: INIT_DELAY,
            command_delay: COMMAND_DELAY,
            state: Arc::new(Mutex::new(ReplState {
                cps: DEFAULT_CPS,
                started_at: Local::now(),
                pid: None,
                last_patterns: HashMap::new(),
            })),
            session: Mutex::new(None),
        }
    }

    /// Overrides the startup delay and the pause between boot commands.
    pub fn with_timing(mut self, init_delay: Duration, command_delay: Duration) -> Self {
        self.init_delay = init_delay;
        self.command_delay = command_delay;
        self
    }

    pub fn with_init_commands(mut self, commands: Vec<String>) -> Self {
        self.init_commands = commands;
        self
    }

    pub fn current_cps(&self) -> f64 {
        self.state.lock().cps
    }

    /// Last successfully evaluated pattern per connection (`d1`, `d2`, `all`, ...).
    pub fn active_patterns(&self) -> HashMap<String, String> {
        self.state.lock().last_patterns.clone()
    }

    /// Sends `pattern` to the REPL as one line.
    pub async fn execute_pattern(&self, pattern: &str) -> Result<(), WatchError> {
        let stdin = self
            .session
            .lock()
            .as_ref()
            .map(|s| Arc::clone(&s.stdin))
            .ok_or(WatchError::NotRunning)?;
        send_line(&stdin, pattern).await
    }

    /// Silences every connection.
    pub async fn hush(&self) -> Result<(), WatchError> {
        self.execute_pattern("hush").await
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for GhciWatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionWatcher for GhciWatcher {
    async fn start(&self, callback: EventCallback) -> Result<(), WatchError> {
        let mut session = self.session.lock();
        if session.is_some() {
            return Err(WatchError::AlreadyRunning { watcher: "GHCi" });
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WatchError::Spawn { command: self.command_line(), source })?;

        // Dropping `child` on these paths kills the process.
        let stdin = child.stdin.take().ok_or(WatchError::Pipe { stream: "stdin" })?;
        let stdout = child.stdout.take().ok_or(WatchError::Pipe { stream: "stdout" })?;
        let stderr = child.stderr.take().ok_or(WatchError::Pipe { stream: "stderr" })?;
        let stdin = Arc::new(AsyncMutex::new(stdin));

        {
            let mut state = self.state.lock();
            state.started_at = Local::now();
            state.pid = child.id();
        }
        debug!(target: "ghci", command = %self.command_line(), pid = ?child.id(), "REPL started");

        let (stop_tx, stop_rx) = stop_signal();
        let tasks = vec![
            tokio::spawn(initialize(
                Arc::clone(&stdin),
                self.init_commands.clone(),
                self.init_delay,
                self.command_delay,
                stop_rx.clone(),
            )),
            tokio::spawn(read_lines(
                stdout,
                Stream::Stdout,
                Arc::clone(&self.state),
                Arc::clone(&callback),
                stop_rx.clone(),
            )),
            tokio::spawn(read_lines(stderr, Stream::Stderr, Arc::clone(&self.state), callback, stop_rx)),
        ];

        *session = Some(Session { child, stdin, stop_tx, tasks });
        Ok(())
    }

    async fn stop(&self) -> Result<(), WatchError> {
        let session = self.session.lock().take();
        let Some(mut session) = session else {
            return Ok(());
        };
        let _ = session.stop_tx.send(true);

        match timeout(QUIT_GRACE, send_line(&session.stdin, ":quit")).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(target: "ghci", "could not send :quit: {e}"),
            Err(_) => debug!(target: "ghci", "REPL stdin is blocked; skipping :quit"),
        }

        match timeout(QUIT_GRACE, session.child.wait()).await {
            Ok(Ok(status)) => debug!(target: "ghci", %status, "REPL exited"),
            _ => {
                if let Err(e) = session.child.kill().await {
                    warn!(target: "ghci", "failed to kill REPL: {e}");
                }
            }
        }

        for task in session.tasks {
            if let Err(e) = task.await {
                warn!(target: "ghci", "REPL task ended abnormally: {e}");
            }
        }
        self.state.lock().pid = None;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.session.lock().is_some()
    }

    fn config(&self) -> WatcherConfig {
        self.config.clone()
    }

    fn language(&self) -> &str {
        LANGUAGE
    }

    fn environment(&self) -> &str {
        ENVIRONMENT
    }
}

async fn send_line(stdin: &AsyncMutex<ChildStdin>, line: &str) -> Result<(), WatchError> {
    let mut stdin = stdin.lock().await;
    stdin.write_all(line.as_bytes()).await.map_err(WatchError::Write)?;
    stdin.write_all(b"\n").await.map_err(WatchError::Write)?;
    stdin.flush().await.map_err(WatchError::Write)
}

async fn initialize(
    stdin: Arc<AsyncMutex<ChildStdin>>,
    commands: Vec<String>,
    init_delay: Duration,
    command_delay: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = stopped(&mut stop_rx) => return,
        _ = sleep(init_delay) => {}
    }
    for command in commands {
        if *stop_rx.borrow() {
            return;
        }
        if let Err(e) = send_line(&stdin, &command).await {
            warn!(target: "ghci", "failed to send boot command {command:?}: {e}");
            return;
        }
        sleep(command_delay).await;
    }
    debug!(target: "ghci", "boot commands sent");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

async fn read_lines<R>(
    reader: R,
    stream: Stream,
    state: Arc<Mutex<ReplState>>,
    callback: EventCallback,
    mut stop_rx: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = stopped(&mut stop_rx) => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                let event = match stream {
                    Stream::Stdout => process_output_line(&state, &line),
                    Stream::Stderr => process_error_line(&state, &line),
                };
                if let Some(event) = event {
                    callback(event);
                }
            }
            Ok(None) => {
                if !*stop_rx.borrow() {
                    warn!(target: "ghci", ?stream, "REPL closed its output");
                }
                break;
            }
            Err(e) => {
                warn!(target: "ghci", ?stream, "error reading REPL output: {e}");
                break;
            }
        }
    }
}

fn process_output_line(state: &Mutex<ReplState>, line: &str) -> Option<ExecutionEvent> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(PROMPT) {
        return None;
    }
    let mut state = state.lock();
    let event = is_pattern_evaluation(line).then(|| pattern_event(&mut state, line, None));
    if is_cps_change(line) {
        if let Some(cps) = parse_cps(line) {
            debug!(target: "ghci", cps, "tempo changed");
            state.cps = cps;
        }
    }
    event
}

fn process_error_line(state: &Mutex<ReplState>, line: &str) -> Option<ExecutionEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(pattern_event(&mut state.lock(), line, Some(line)))
}

fn pattern_event(state: &mut ReplState, content: &str, error: Option<&str>) -> ExecutionEvent {
    let now = Local::now();
    let connection = extract_connection(content);
    let cycles = cycles_between(state.started_at, now, state.cps);

    let mut event = ExecutionEvent::new(now, content, connection.clone(), LANGUAGE, ENVIRONMENT);
    match error {
        Some(message) => event = event.failed(message),
        None => {
            state.last_patterns.insert(connection.clone(), content.to_string());
        }
    }
    event.bpm = Some(state.cps * 60.0);
    event.beats_from_start = Some((cycles * 4.0) as i64);
    event.process_id = state.pid;
    event.extra_data = HashMap::from([
        ("connection".to_string(), connection),
        ("cps".to_string(), format!("{:.4}", state.cps)),
    ]);
    event
}

pub fn is_pattern_evaluation(line: &str) -> bool {
    PATTERN_MARKERS.iter().any(|m| line.contains(m))
}

pub fn is_cps_change(line: &str) -> bool {
    line.contains("cps") || line.contains("bps")
}

/// Cycles per second announced on `line`; `bps` values are converted.
pub fn parse_cps(line: &str) -> Option<f64> {
    let value: f64 = cps_regex().captures(line)?[1].parse().ok()?;
    Some(if line.contains("bps") { value / 4.0 } else { value })
}

/// Connection a line of Tidal code targets: `d<n>`, `all` for `hush`, else `unknown`.
pub fn extract_connection(content: &str) -> String {
    if let Some(c) = connection_regex().captures(content) {
        return c[1].to_string();
    }
    if content.contains("hush") {
        return "all".to_string();
    }
    "unknown".to_string()
}

/// Cycles elapsed between `start` and `now` at a constant `cps`.
pub fn cycles_between(start: DateTime<Local>, now: DateTime<Local>, cps: f64) -> f64 {
    (now - start).to_std().unwrap_or_default().as_secs_f64() * cps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchers::testing::{eventually, recorder};

    fn fresh_state() -> Mutex<ReplState> {
        Mutex::new(ReplState {
            cps: DEFAULT_CPS,
            started_at: Local::now(),
            pid: Some(42),
            last_patterns: HashMap::new(),
        })
    }

    fn cat_watcher() -> GhciWatcher {
        GhciWatcher::with_command(WatcherConfig::new(LANGUAGE, ENVIRONMENT, &[]), "cat", Vec::new())
            .with_timing(Duration::ZERO, Duration::ZERO)
            .with_init_commands(Vec::new())
    }

    // ── parsing ───────────────────────────────────────────────────────────────

    #[test]
    fn connection_extraction() {
        assert_eq!(extract_connection("d1 $ sound \"bd*2\""), "d1");
        assert_eq!(extract_connection("d12 $ silence"), "d12");
        assert_eq!(extract_connection("hush"), "all");
        assert_eq!(extract_connection("once $ sound \"cp\""), "unknown");
        assert_eq!(extract_connection("odd1 $ x"), "unknown");
    }

    #[test]
    fn cps_parsing_converts_bps() {
        assert_eq!(parse_cps("cps 0.75"), Some(0.75));
        assert_eq!(parse_cps("setcps (1.2)"), Some(1.2));
        assert_eq!(parse_cps("bps 2"), Some(0.5));
        assert_eq!(parse_cps("cps (x/4)"), None);
    }

    #[test]
    fn pattern_markers() {
        assert!(is_pattern_evaluation("d3 $ n \"0 .. 7\""));
        assert!(is_pattern_evaluation("hush"));
        assert!(is_pattern_evaluation("d1 silence"));
        assert!(!is_pattern_evaluation("Loaded GHCi configuration"));
    }

    // ── line processing ───────────────────────────────────────────────────────

    #[test]
    fn output_line_produces_event_and_tracks_pattern() {
        let state = fresh_state();
        let event = process_output_line(&state, "  d2 $ sound \"hh*4\"  ").unwrap();
        assert!(event.success);
        assert_eq!(event.buffer, "d2");
        assert_eq!(event.content, "d2 $ sound \"hh*4\"");
        assert_eq!(event.bpm, Some(DEFAULT_CPS * 60.0));
        assert_eq!(event.process_id, Some(42));
        assert_eq!(event.extra_data["cps"], "0.5625");
        assert_eq!(state.lock().last_patterns["d2"], "d2 $ sound \"hh*4\"");
    }

    #[test]
    fn prompt_and_blank_lines_are_ignored() {
        let state = fresh_state();
        assert!(process_output_line(&state, "tidal> d1 $ sound \"bd\"").is_none());
        assert!(process_output_line(&state, "   ").is_none());
    }

    #[test]
    fn tempo_line_updates_cps() {
        let state = fresh_state();
        assert!(process_output_line(&state, "cps 1.5").is_none());
        assert_eq!(state.lock().cps, 1.5);
        let event = process_output_line(&state, "d1 $ sound \"bd\"").unwrap();
        assert_eq!(event.bpm, Some(90.0));
    }

    #[test]
    fn error_line_is_failed_event_without_tracking() {
        let state = fresh_state();
        let event = process_error_line(&state, "Variable not in scope: d10").unwrap();
        assert!(!event.success);
        assert_eq!(event.error_message.as_deref(), Some("Variable not in scope: d10"));
        assert_eq!(event.buffer, "d10");
        assert!(state.lock().last_patterns.is_empty());
        assert!(process_error_line(&state, "").is_none());
    }

    #[test]
    fn cycles_are_non_decreasing() {
        let start = Local::now();
        let mut last = 0.0;
        for ms in [0, 10, 500, 1_000, 4_000] {
            let cycles = cycles_between(start, start + chrono::Duration::milliseconds(ms), 0.5);
            assert!(cycles >= last);
            last = cycles;
        }
        assert_eq!(last, 2.0);
    }

    // ── subprocess ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn spawn_failure_is_returned() {
        let watcher = GhciWatcher::with_command(
            WatcherConfig::new(LANGUAGE, ENVIRONMENT, &[]),
            "/definitely/not/ghci",
            Vec::new(),
        );
        let (callback, _) = recorder();
        assert!(matches!(watcher.start(callback).await, Err(WatchError::Spawn { .. })));
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn execute_pattern_requires_running_repl() {
        let watcher = cat_watcher();
        assert!(matches!(
            watcher.execute_pattern("d1 $ silence").await,
            Err(WatchError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn echoed_patterns_become_events() {
        let watcher = cat_watcher();
        let (callback, events) = recorder();
        watcher.start(callback).await.unwrap();

        let (again, _) = recorder();
        assert!(matches!(watcher.start(again).await, Err(WatchError::AlreadyRunning { .. })));

        watcher.execute_pattern("d1 $ sound \"bd*2\"").await.unwrap();
        assert!(eventually(|| events.lock().len() == 1).await);
        watcher.hush().await.unwrap();
        assert!(eventually(|| events.lock().len() == 2).await);

        let patterns = watcher.active_patterns();
        assert_eq!(patterns["d1"], "d1 $ sound \"bd*2\"");
        assert_eq!(patterns["all"], "hush");

        watcher.stop().await.unwrap();
        assert!(!watcher.is_running());
        watcher.stop().await.unwrap();

        let events = events.lock();
        assert_eq!(events[0].buffer, "d1");
        assert!(events[0].process_id.is_some());
        assert_eq!(events[1].buffer, "all");
    }

    #[tokio::test]
    async fn boot_commands_are_sent() {
        let watcher = GhciWatcher::with_command(WatcherConfig::new(LANGUAGE, ENVIRONMENT, &[]), "cat", Vec::new())
            .with_timing(Duration::ZERO, Duration::ZERO);
        let (callback, events) = recorder();
        watcher.start(callback).await.unwrap();

        // The echoed `let hush = ...` definition mentions both markers.
        assert!(eventually(|| events.lock().iter().any(|e| e.content.starts_with("let hush"))).await);
        watcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stderr_lines_become_failed_events() {
        let watcher = GhciWatcher::with_command(
            WatcherConfig::new(LANGUAGE, ENVIRONMENT, &[]),
            "sh",
            vec!["-c".into(), "echo 'parse error on input' 1>&2; cat".into()],
        )
        .with_init_commands(Vec::new());
        let (callback, events) = recorder();
        watcher.start(callback).await.unwrap();

        assert!(eventually(|| !events.lock().is_empty()).await);
        watcher.stop().await.unwrap();

        let events = events.lock();
        assert!(!events[0].success);
        assert_eq!(events[0].error_message.as_deref(), Some("parse error on input"));
        assert_eq!(events[0].buffer, "unknown");
    }

    #[test]
    fn from_config_splits_command() {
        let config = WatcherConfig::new(LANGUAGE, ENVIRONMENT, &[("ghci_command", "stack exec -- ghci")]);
        let watcher = GhciWatcher::from_config(&config);
        assert_eq!(watcher.program, "stack");
        assert_eq!(watcher.args, vec!["exec", "--", "ghci"]);
        assert_eq!(watcher.command_line(), "stack exec -- ghci");
    }

    #[tokio::test]
    async fn stop_does_not_wait_on_blocked_stdin() {
        let watcher = GhciWatcher::with_command(
            WatcherConfig::new(LANGUAGE, ENVIRONMENT, &[]),
            "sh",
            vec!["-c".to_string(), "sleep 30".to_string()],
        )
        .with_timing(Duration::ZERO, Duration::ZERO)
        .with_init_commands(Vec::new());
        let (callback, _) = recorder();
        watcher.start(callback).await.unwrap();

        let stdin = watcher.session.lock().as_ref().map(|s| Arc::clone(&s.stdin)).unwrap();
        let held = stdin.lock().await;

        tokio::time::timeout(Duration::from_secs(3), watcher.stop())
            .await
            .expect("stop finished while stdin was held")
            .unwrap();
        assert!(!watcher.is_running());
        drop(held);
    }
}
