//! Process logging. Console output goes to stderr so command output on
//! stdout stays machine-readable; an optional daily-rolling JSON file sink
//! mirrors it.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::LoggingSection;

/// Crates that are noisy at debug level.
const QUIET_CRATES: &str = "hyper=warn,reqwest=warn,html5ever=error,selectors=warn";

/// Filter directives: `RUST_LOG` wins when set; otherwise other crates log at
/// `warn` and flagforge at the configured level (`debug` with `--verbose`).
pub fn filter_directives(level: &str, verbose: bool, rust_log: Option<&str>) -> String {
    if let Some(rust_log) = rust_log.map(str::trim).filter(|v| !v.is_empty()) {
        return format!("{},{}", rust_log, QUIET_CRATES);
    }
    let level = if verbose { "debug" } else { level.trim() };
    let level = if level.is_empty() { "info" } else { level };
    format!("warn,flagforge={},{}", level, QUIET_CRATES)
}

/// Install the global subscriber. Keep the returned guard alive until exit
/// so buffered file output is flushed.
pub fn init(config: &LoggingSection, verbose: bool) -> Result<Option<WorkerGuard>> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let directives = filter_directives(&config.level, verbose, rust_log.as_deref());
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("Invalid log filter '{}'", directives))?;

    let console = if config.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).with_target(false).boxed()
    };

    let (file_layer, guard) = match config.file_path() {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| ".".into());
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "flagforge.log".into());
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(&dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}
