//! EduGraph CLI
//!
//! Drives the incremental upsert and batch engine against Neo4j or an
//! in-memory store.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use edugraph_core::{LogFormat, Settings};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod output;

use commands::Cli;

/// Initialize tracing with optional file logging.
///
/// Console output goes to stderr so that command results on stdout stay
/// machine-readable. The returned guard flushes the file writer on drop.
fn init_tracing(level: &str, format: LogFormat, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("edugraph={level}")))
        .context("invalid log filter")?;

    let (console, json) = match format {
        LogFormat::Console => (Some(fmt::layer().with_writer(std::io::stderr)), None),
        LogFormat::Json => (None, Some(fmt::layer().json().with_writer(std::io::stderr))),
    };

    let mut guard = None;
    let file = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log directory {}", dir.display()))?;
            let name = path
                .file_name()
                .ok_or_else(|| anyhow!("log file path has no file name: {}", path.display()))?;

            let (writer, flush) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            guard = Some(flush);
            Some(fmt::layer().with_writer(writer).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(json)
        .with(file)
        .try_init()?;

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    let format = cli.log_format.unwrap_or(settings.log.format);
    let _guard = init_tracing(&settings.log.level, format, cli.log_file.as_deref())?;

    cli.execute(settings).await
}
