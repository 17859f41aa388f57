//! Sonic Pi execution watcher fed by UDP datagrams.
//!
//! Payloads are read as newline-separated text rather than decoded OSC
//! packets. Lines carrying an execution marker (`/run-code`, `/stop-all`, ...)
//! become events; `/bpm` and `use_bpm` lines update the tempo used for beat
//! counting.
//!
//! Sonic Pi never sends the executed source over this channel, so event
//! content is a placeholder naming the buffer, not the code that ran.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use regex::Regex;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{stop_signal, stopped, EventCallback, ExecutionWatcher};
use crate::config::{WatcherConfig, DEFAULT_OSC_PORT};
use crate::error::WatchError;
use crate::event::ExecutionEvent;

const LANGUAGE: &str = "sonicpi";
const ENVIRONMENT: &str = "sonic-pi";
pub const DEFAULT_BPM: f64 = 120.0;
const DEFAULT_BUFFER: &str = "workspace-0";
/// Upper bound on a single blocking read so the loop sees stop requests promptly.
const READ_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_DATAGRAM: usize = 4096;

const EXECUTION_MARKERS: [&str; 4] = ["/run-code", "/stop-all", "/start-recording", "/buffer-update"];

fn bpm_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:bpm|BPM)[\s:=]*(\d+(?:\.\d+)?)").expect("static regex"))
}

fn buffer_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"buffer[:\s]+(\w+)").expect("static regex"))
}

/// Tempo state shared between the watcher and its read loop.
#[derive(Debug)]
struct Tempo {
    bpm: f64,
    started_at: DateTime<Local>,
}

struct Running {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

pub struct OscWatcher {
    config: WatcherConfig,
    port: u16,
    workspace_path: String,
    tempo: Arc<Mutex<Tempo>>,
    running: Mutex<Option<Running>>,
}

impl OscWatcher {
    pub fn new(port: u16, workspace_path: impl Into<String>) -> Self {
        let workspace_path = workspace_path.into();
        let port_text = port.to_string();
        let mut config = WatcherConfig::new(
            LANGUAGE,
            ENVIRONMENT,
            &[("osc_port", port_text.as_str()), ("workspace_path", workspace_path.as_str())],
        );
        config.enabled = true;
        Self {
            config,
            port,
            workspace_path,
            tempo: Arc::new(Mutex::new(Tempo { bpm: DEFAULT_BPM, started_at: Local::now() })),
            running: Mutex::new(None),
        }
    }

    /// Builds a watcher from its config entry, defaulting the port to 4559.
    pub fn from_config(config: &WatcherConfig) -> Self {
        let port = config
            .option("osc_port")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_OSC_PORT);
        let mut watcher = Self::new(port, config.option("workspace_path").unwrap_or_default());
        watcher.config.enabled = config.enabled;
        watcher
    }

    /// Address the socket is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    pub fn current_bpm(&self) -> f64 {
        self.tempo.lock().bpm
    }
}

#[async_trait]
impl ExecutionWatcher for OscWatcher {
    async fn start(&self, callback: EventCallback) -> Result<(), WatchError> {
        // Held across the bind so concurrent starts cannot both succeed.
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(WatchError::AlreadyRunning { watcher: "OSC" });
        }

        let std_socket = std::net::UdpSocket::bind(("0.0.0.0", self.port))
            .and_then(|s| s.set_nonblocking(true).map(|_| s))
            .map_err(|source| WatchError::Bind { port: self.port, source })?;
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|source| WatchError::Bind { port: self.port, source })?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| WatchError::Bind { port: self.port, source })?;

        {
            let mut tempo = self.tempo.lock();
            tempo.started_at = Local::now();
        }

        let (stop_tx, stop_rx) = stop_signal();
        let listener = Listener {
            socket,
            callback,
            tempo: Arc::clone(&self.tempo),
            workspace_path: self.workspace_path.clone(),
        };
        let task = tokio::spawn(listener.run(stop_rx));

        debug!(target: "osc", %local_addr, "listening for Sonic Pi messages");
        *running = Some(Running { stop_tx, task, local_addr });
        Ok(())
    }

    async fn stop(&self) -> Result<(), WatchError> {
        let run = self.running.lock().take();
        let Some(run) = run else {
            return Ok(());
        };
        let _ = run.stop_tx.send(true);
        // The socket is dropped when the listener task returns.
        if let Err(e) = run.task.await {
            warn!(target: "osc", "listener task ended abnormally: {e}");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.lock().is_some()
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

/// Owns the socket for one run of the watcher.
struct Listener {
    socket: UdpSocket,
    callback: EventCallback,
    tempo: Arc<Mutex<Tempo>>,
    workspace_path: String,
}

impl Listener {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = stopped(&mut stop_rx) => break,
                read = timeout(READ_TIMEOUT, self.socket.recv_from(&mut buf)) => match read {
                    // Timeout: nothing arrived this cycle.
                    Err(_) => continue,
                    Ok(Err(e)) => warn!(target: "osc", "error reading message: {e}"),
                    Ok(Ok((n, from))) => {
                        let text = String::from_utf8_lossy(&buf[..n]);
                        self.process_message(&text, from);
                    }
                },
            }
        }
        debug!(target: "osc", "listener stopped");
    }

    fn process_message(&self, message: &str, from: SocketAddr) {
        for line in message.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if is_execution_message(line) {
                let event = self.execution_event(line, from);
                (self.callback)(event);
            } else if is_bpm_message(line) {
                if let Some(bpm) = parse_bpm(line) {
                    debug!(target: "osc", bpm, "tempo changed");
                    self.tempo.lock().bpm = bpm;
                }
            }
        }
    }

    fn execution_event(&self, line: &str, from: SocketAddr) -> ExecutionEvent {
        let now = Local::now();
        let buffer = extract_buffer(line);
        let (bpm, beats) = {
            let tempo = self.tempo.lock();
            (tempo.bpm, beats_between(tempo.started_at, now, tempo.bpm))
        };

        let mut event = ExecutionEvent::new(
            now,
            placeholder_content(&buffer, &self.workspace_path, now),
            buffer,
            LANGUAGE,
            ENVIRONMENT,
        );
        if line.contains("/error") {
            event = event.failed(extract_error(line));
        }
        event.bpm = Some(bpm);
        event.beats_from_start = Some(beats);
        event.extra_data = HashMap::from([
            ("osc_message".to_string(), line.to_string()),
            ("source".to_string(), from.to_string()),
        ]);
        event
    }
}

pub fn is_execution_message(line: &str) -> bool {
    EXECUTION_MARKERS.iter().any(|m| line.contains(m))
}

pub fn is_bpm_message(line: &str) -> bool {
    line.contains("/bpm") || line.contains("use_bpm")
}

pub fn parse_bpm(line: &str) -> Option<f64> {
    bpm_regex()
        .captures(line)
        .and_then(|c| c[1].parse().ok())
}

pub fn extract_buffer(line: &str) -> String {
    buffer_regex()
        .captures(line)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| DEFAULT_BUFFER.to_string())
}

pub fn extract_error(line: &str) -> String {
    match line.split_once("/error") {
        Some((_, rest)) if !rest.trim().is_empty() => rest.trim().to_string(),
        _ => "Unknown error".to_string(),
    }
}

/// Whole beats elapsed between `start` and `now` at a constant `bpm`.
pub fn beats_between(start: DateTime<Local>, now: DateTime<Local>, bpm: f64) -> i64 {
    let elapsed = (now - start).to_std().unwrap_or_default();
    (elapsed.as_secs_f64() * (bpm / 60.0)) as i64
}

fn placeholder_content(buffer: &str, workspace_path: &str, now: DateTime<Local>) -> String {
    if workspace_path.is_empty() {
        format!("# Code executed in buffer: {buffer}\n# (content not available without workspace path)")
    } else {
        format!("# Executed at {}\n# Buffer: {buffer}", now.format("%H:%M:%S"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchers::testing::{eventually, recorder};

    async fn started() -> (OscWatcher, Arc<Mutex<Vec<ExecutionEvent>>>, SocketAddr) {
        let watcher = OscWatcher::new(0, "");
        let (callback, events) = recorder();
        watcher.start(callback).await.unwrap();
        let port = watcher.local_addr().unwrap().port();
        (watcher, events, SocketAddr::from(([127, 0, 0, 1], port)))
    }

    async fn send(to: SocketAddr, payload: &str) {
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(payload.as_bytes(), to).await.unwrap();
    }

    // ── line classification ───────────────────────────────────────────────────

    #[test]
    fn recognises_execution_markers() {
        assert!(is_execution_message("/run-code buffer: workspace_3"));
        assert!(is_execution_message("/stop-all"));
        assert!(is_execution_message("/buffer-update x"));
        assert!(!is_execution_message("/info hello"));
    }

    #[test]
    fn parses_bpm_values() {
        assert!(is_bpm_message("/bpm 140"));
        assert!(is_bpm_message("use_bpm 90"));
        assert_eq!(parse_bpm("/bpm 140"), Some(140.0));
        assert_eq!(parse_bpm("use_bpm 92.5"), Some(92.5));
        assert_eq!(parse_bpm("BPM=128"), Some(128.0));
        assert_eq!(parse_bpm("/bpm fast"), None);
    }

    #[test]
    fn extracts_buffer_and_error() {
        assert_eq!(extract_buffer("/run-code buffer: workspace_3"), "workspace_3");
        assert_eq!(extract_buffer("/run-code"), DEFAULT_BUFFER);
        assert_eq!(extract_error("/run-code /error undefined method"), "undefined method");
        assert_eq!(extract_error("/run-code /error"), "Unknown error");
    }

    #[test]
    fn beats_are_non_decreasing_at_constant_tempo() {
        let start = Local::now();
        let mut last = 0;
        for ms in [0, 250, 499, 500, 1_000, 1_001, 60_000] {
            let now = start + chrono::Duration::milliseconds(ms);
            let beats = beats_between(start, now, 120.0);
            assert!(beats >= last, "beats went backwards at {ms}ms");
            last = beats;
        }
        assert_eq!(last, 120);
    }

    #[test]
    fn beats_before_start_are_zero() {
        let start = Local::now();
        let earlier = start - chrono::Duration::seconds(5);
        assert_eq!(beats_between(start, earlier, 120.0), 0);
    }

    // ── lifecycle ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn start_twice_fails_and_keeps_socket() {
        let (watcher, _events, _) = started().await;
        let addr = watcher.local_addr();
        let (other, _) = recorder();
        assert!(matches!(
            watcher.start(other).await,
            Err(WatchError::AlreadyRunning { .. })
        ));
        assert_eq!(watcher.local_addr(), addr);
        watcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let watcher = OscWatcher::new(0, "");
        watcher.stop().await.unwrap();
        assert!(!watcher.is_running());

        let (callback, _) = recorder();
        watcher.start(callback).await.unwrap();
        watcher.stop().await.unwrap();
        watcher.stop().await.unwrap();
        assert!(!watcher.is_running());
        assert!(watcher.local_addr().is_none());
    }

    #[tokio::test]
    async fn bind_failure_is_returned() {
        let taken = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let watcher = OscWatcher::new(port, "");
        let (callback, _) = recorder();
        assert!(matches!(watcher.start(callback).await, Err(WatchError::Bind { .. })));
        assert!(!watcher.is_running());
    }

    // ── detection ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn datagram_lines_become_events() {
        let (watcher, events, addr) = started().await;

        send(addr, "/bpm 90\n/run-code buffer: workspace_2\n/info ignored\n").await;
        assert!(eventually(|| events.lock().len() == 1).await);

        send(addr, "/run-code buffer: workspace_1 /error boom").await;
        assert!(eventually(|| events.lock().len() == 2).await);
        watcher.stop().await.unwrap();

        let events = events.lock();
        let ok = &events[0];
        assert!(ok.success);
        assert_eq!(ok.buffer, "workspace_2");
        assert_eq!(ok.bpm, Some(90.0));
        assert_eq!(ok.language, "sonicpi");
        assert!(ok.content.contains("workspace_2"));
        assert_eq!(
            ok.extra_data.get("osc_message").map(String::as_str),
            Some("/run-code buffer: workspace_2")
        );

        let failed = &events[1];
        assert!(!failed.success);
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn from_config_reads_port_and_enabled() {
        let mut config = WatcherConfig::new("sonicpi", "sonic-pi", &[("osc_port", "4560")]);
        config.enabled = false;
        let watcher = OscWatcher::from_config(&config);
        assert_eq!(watcher.port, 4560);
        assert!(!watcher.config().enabled);
        assert_eq!(watcher.config().option("osc_port"), Some("4560"));
    }
}
