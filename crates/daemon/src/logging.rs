//! Logging setup
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: filter directives (default: `gateway=info`)
//! - `GATEWAY_LOG_FORMAT`: `json` for structured output, anything else for pretty
//! - `GATEWAY_LOG_DIR`: when set, also write a daily rolling log file there

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "gateway=info";
const LOG_FILE_PREFIX: &str = "gateway.log";

/// Install the global subscriber
///
/// The returned guard flushes the file writer; keep it alive until exit.
pub fn init_logging() -> Result<Option<WorkerGuard>> {
    let log_format = std::env::var("GATEWAY_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .context("Failed to create env filter")?;

    let console = match log_format.as_str() {
        // Production: JSON structured logging
        "json" => fmt::layer().json().boxed(),
        // Development: Pretty formatting with colors
        _ => fmt::layer().pretty().boxed(),
    };

    let (file, guard) = match std::env::var("GATEWAY_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let dir = shellexpand::tilde(&dir).into_owned();
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
