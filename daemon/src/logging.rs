//! Log output for the daemon.
//!
//! The configured `log_level` sets the default filter. `RUST_LOG` takes
//! precedence when set:
//! ```bash
//! RUST_LOG=debug livecode-watchd
//! RUST_LOG=info,ghci=debug livecode-watchd --lang tidal
//! ```

use std::fmt;
use std::sync::Once;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LogLevel;

static INIT: Once = Once::new();

/// Local wall-clock time as `HH:MM:SS.mmm`.
fn local_clock(w: &mut Writer<'_>) -> fmt::Result {
    write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
}

/// Builds the filter for `level`, honouring `RUST_LOG` when present.
pub fn filter_for(level: LogLevel) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(level.as_str())
    }
}

/// Installs the global subscriber. Only the first call takes effect.
pub fn init(level: LogLevel) {
    INIT.call_once(|| {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_timer(local_clock as fn(&mut Writer<'_>) -> fmt::Result)
            .with_level(true)
            .with_filter(filter_for(level));

        // A subscriber installed by an embedding application wins.
        let _ = tracing_subscriber::registry().with(fmt_layer).try_init();
    });
}
