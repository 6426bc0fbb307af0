//! Cumulus drive server entry point.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

use cumulus_server::{DriveConfig, DriveServer};

/// Single-host personal cloud-drive server.
#[derive(Debug, Parser)]
#[command(name = "cumulus-server", version, about)]
struct Args {
    /// Path to the key=value configuration file.
    #[arg(default_value = "server/config/server.conf")]
    config_path: PathBuf,
}

/// `tracing` writer appending to the configured log file.
struct LogWriter(Arc<File>);

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        (&*self.0).flush()
    }
}

fn init_logging(path: &std::path::Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = Arc::new(
        File::options()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?,
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .with_writer(move || LogWriter(Arc::clone(&file)))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = DriveConfig::load(&args.config_path);
    init_logging(&config.log_file)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config_path.display(),
        "starting cumulus drive server"
    );

    let server =
        Arc::new(DriveServer::new(config).context("server initialization failed")?);

    let runner = Arc::clone(&server);
    let mut run_task = tokio::spawn(async move { runner.run().await });

    println!("Cumulus drive server started. Press Ctrl+C to stop.");

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
        result = &mut run_task => {
            // The accept loop ended on its own; surface why.
            result.context("server task panicked")??;
            return Ok(());
        }
    }

    println!("Stopping server...");
    server.shutdown();
    run_task.await.context("server task panicked")??;
    Ok(())
}
