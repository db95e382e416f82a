// =============================================================================
// Logging — daily-rolling activity log plus optional console output
// =============================================================================

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// `RUST_LOG` when set, `info` otherwise.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Activity goes to
/// `<log_dir>/<SYMBOL>_bot_activity.log.<date>`, rolled daily.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the process.
pub fn init_tracing(log_dir: &Path, symbol: &str, console: bool) -> Result<WorkerGuard> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let appender =
        tracing_appender::rolling::daily(log_dir, format!("{symbol}_bot_activity.log"));
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(writer)
        .with_filter(env_filter());

    let console_layer = console.then(|| {
        fmt::layer()
            .with_target(false)
            .with_filter(env_filter())
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}
