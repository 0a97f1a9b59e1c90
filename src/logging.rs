use anyhow::{Context, Result};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::fs::File;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Target of the in-process node's own logging.
const SIM_TARGET: &str = "rh205_lib::sim";

/// Console logging plus an optional plain-text log file.
///
/// The simulated node is held to warnings until `-v`, unless `RUST_LOG` says otherwise.
/// Keep the returned guard alive for the life of the program or the file writer stops.
pub fn setup_logging(log_file_path: Option<PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    // stderr so --json output on stdout stays parseable
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .without_time();

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(true);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let level = verbosity.tracing_level_filter();
    let mut filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();
    if level < LevelFilter::DEBUG && std::env::var_os(EnvFilter::DEFAULT_ENV).is_none() {
        filter = filter.add_directive(format!("{SIM_TARGET}=warn").parse::<Directive>()?);
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}
