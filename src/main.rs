mod broute;
mod cache;
mod config;
mod dongle;
mod frame;
mod recorder;
mod serial;
mod supervisor;
mod types;
mod uploader;
mod worker;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::supervisor::{LogControl, Supervisor};

#[derive(Parser)]
#[command(name = "meterlog")]
#[command(about = "Record electric power telemetry from a smart meter via a Wi-SUN B-route dongle")]
struct Cli {
    /// Worker configuration file
    #[arg(short, long, default_value = "meterlog.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // DEBUG in the environment selects verbose logging on stderr; otherwise
    // logs go to a daily-rolling file in the working directory
    let verbose = std::env::var_os("DEBUG").is_some();
    let (log, _guard) = init_logging(verbose);

    let config = config::load(&cli.config)?;
    info!(
        config = %cli.config.display(),
        workers = config.workers.len(),
        "meterlog starting"
    );

    Supervisor::new(config.workers, log).run().await
}

/// Install the tracing subscriber. The level filter sits behind a reload
/// layer so the supervisor can flip it on SIGUSR1. The returned guard keeps
/// the file writer flushing until exit.
fn init_logging(verbose: bool) -> (LogControl, Option<tracing_appender::non_blocking::WorkerGuard>) {
    let directive = if verbose { "debug" } else { "info" };
    let (filter, handle) = tracing_subscriber::reload::Layer::new(EnvFilter::new(directive));

    if verbose {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
        (LogControl::new(handle, verbose), None)
    } else {
        let appender = tracing_appender::rolling::daily(".", "meterlog.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false),
            )
            .init();
        (LogControl::new(handle, verbose), Some(guard))
    }
}
