//! Logging configuration using tracing.
//!
//! The terminal belongs to the progress UI, so records go to
//! `<log_dir>/devstack.log` through a non-blocking appender. Keep the
//! returned guard alive until exit or buffered records are lost.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub const LOG_FILE: &str = "devstack.log";

fn filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Initialize the global subscriber writing to `log_dir/devstack.log`.
pub fn init(log_dir: &Path, verbose: bool, json: bool) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let appender = tracing_appender::rolling::never(log_dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = fmt::layer().with_writer(writer).with_ansi(false);
    let result = if json {
        tracing_subscriber::registry()
            .with(filter(verbose))
            .with(layer.json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter(verbose))
            .with(layer)
            .try_init()
    };
    result.context("Failed to install tracing subscriber")?;

    Ok(guard)
}

/// Initialize a stderr subscriber for commands that do not draw a UI.
pub fn init_stderr(verbose: bool, json: bool) -> Result<()> {
    let layer = fmt::layer().with_writer(std::io::stderr);
    let result = if json {
        tracing_subscriber::registry()
            .with(filter(verbose))
            .with(layer.json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter(verbose))
            .with(layer)
            .try_init()
    };
    result.context("Failed to install tracing subscriber")
}
