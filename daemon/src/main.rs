use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use livecode_watchd::config::{ConfigManager, FILES_WATCHER, GHCI_WATCHER, OSC_WATCHER};
use livecode_watchd::service::WatcherService;
use livecode_watchd::store::JournalStore;
use livecode_watchd::{logging, paths, status};

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Watch live-coding environments and commit every code execution.
#[derive(Parser, Debug)]
#[command(name = "livecode-watchd", version, about)]
struct Cli {
    /// Watcher configuration file [default: ~/.livecodegit/watchers.json]
    #[arg(long)]
    config: Option<PathBuf>,

    /// Repository that receives the commits [default: current directory]
    #[arg(long)]
    repo: Option<PathBuf>,

    /// Enable and start the watchers for a language (sonicpi, tidal)
    #[arg(long)]
    lang: Option<String>,

    /// List the available watchers and their options
    #[arg(long)]
    list: bool,

    /// Show the watcher service status
    #[arg(long)]
    status: bool,

    /// Enable a watcher by name
    #[arg(long, value_name = "NAME")]
    enable: Option<String>,

    /// Disable a watcher by name
    #[arg(long, value_name = "NAME")]
    disable: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = cli.config.clone().unwrap_or_else(paths::config_file_path);
    let level = {
        let settings = ConfigManager::new(&config_path);
        settings.load().map(|()| settings.config().log_level()).unwrap_or_default()
    };
    logging::init(level);

    // ── Commit store ──────────────────────────────────────────────────────────
    let repo = match cli.repo.clone() {
        Some(repo) => repo,
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };
    let store = Arc::new(
        JournalStore::init(&repo)
            .with_context(|| format!("failed to open repository at {}", repo.display()))?,
    );

    // ── Service ───────────────────────────────────────────────────────────────
    let service = WatcherService::new(store.clone(), &config_path);
    service
        .initialize()
        .context("failed to initialize watcher service")?;

    if cli.list {
        print!(
            "{}",
            status::render_watcher_list(&service.enabled_watchers(), |name| {
                service.watcher_config(name)
            })
        );
        return Ok(());
    }
    if cli.status {
        print!("{}", status::render_status(&service.stats(), &service.enabled_watchers()));
        return Ok(());
    }
    if let Some(name) = &cli.enable {
        service
            .enable_watcher(name)
            .with_context(|| format!("failed to enable watcher {name}"))?;
        println!("Enabled watcher: {name}");
        return Ok(());
    }
    if let Some(name) = &cli.disable {
        service
            .disable_watcher(name)
            .await
            .with_context(|| format!("failed to disable watcher {name}"))?;
        println!("Disabled watcher: {name}");
        return Ok(());
    }

    match &cli.lang {
        Some(lang) => {
            let names = watchers_for_language(lang);
            if names.is_empty() {
                bail!("no watchers available for language {lang} (available: sonicpi, tidal)");
            }
            for name in names {
                if let Err(e) = service.enable_watcher(name) {
                    tracing::warn!(target: "service", watcher = name, "failed to enable: {e}");
                }
            }
            println!("Starting watchers for {lang}...");
        }
        None => {
            let enabled = service.enabled_watchers();
            if enabled.is_empty() {
                bail!(
                    "no watchers are enabled; run with --list to see them and --enable <NAME> to enable one"
                );
            }
            println!("Starting {} enabled watchers...", enabled.len());
        }
    }

    // ── Run ───────────────────────────────────────────────────────────────────
    let performance = store.start_performance(&format!(
        "watch {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M")
    ));
    tracing::debug!(target: "service", id = %performance.id, "performance started");

    service
        .start()
        .await
        .context("failed to start watcher service")?;
    println!("livecode-watchd v{} started. Press Ctrl+C to stop.", env!("CARGO_PKG_VERSION"));

    let mut ticker = interval_at(Instant::now() + STATUS_INTERVAL, STATUS_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl+C")?;
                break;
            }
            _ = ticker.tick() => {
                let stats = service.stats();
                if stats.total_executions > 0 {
                    tracing::info!(target: "service", "status: {}", stats.summary());
                }
            }
        }
    }

    println!("\nShutting down watcher service...");
    if let Err(e) = service.stop().await {
        tracing::error!(target: "service", "error stopping service: {e}");
    }
    println!("Final stats: {}", service.stats().summary());
    Ok(())
}

fn watchers_for_language(language: &str) -> &'static [&'static str] {
    match language.to_lowercase().as_str() {
        "sonicpi" | "sonic-pi" => &[OSC_WATCHER, FILES_WATCHER],
        "tidal" | "tidalcycles" | "tidal-cycles" => &[GHCI_WATCHER],
        _ => &[],
    }
}
