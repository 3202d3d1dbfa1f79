/*
[INPUT]:  CLI arguments, YAML configuration file, OS shutdown signals
[OUTPUT]: Stream messages printed as JSON lines, graceful teardown
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags, startup flow, or shutdown handling
*/

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use exgate_tap::{Tap, TapConfig, pump_lines, spawn_printer};

#[derive(Parser, Debug)]
#[command(name = "exgate-tap", version, about = "Print exchange WebSocket streams as JSON lines")]
struct Cli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: PathBuf,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
    #[arg(long = "dry-run")]
    dry_run: bool,
    /// Exit after printing this many messages
    #[arg(long = "max-messages", value_name = "N")]
    max_messages: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(&args.log_level)?;

    info!(
        config_path = %args.config_path.display(),
        dry_run = args.dry_run,
        "starting exgate-tap"
    );

    let config = TapConfig::from_file(&args.config_path).context("load config")?;
    info!(
        stream_count = config.streams.len(),
        subscription_count = config.subscription_count(),
        "configuration loaded"
    );

    if args.dry_run {
        info!("dry-run requested; configuration validated");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    let tap = Tap::new(config).context("build tap")?;
    let feeds = match tap.subscribe_all().await {
        Ok(feeds) => feeds,
        Err(err) => {
            tap.shutdown(&[]).await;
            return Err(err.context("subscribe streams"));
        }
    };
    info!(feed_count = feeds.len(), "streams subscribed");

    let (lines_tx, lines_rx) = mpsc::unbounded_channel();
    let printers: Vec<_> = feeds
        .iter()
        .cloned()
        .map(|feed| spawn_printer(feed, lines_tx.clone(), shutdown.clone()))
        .collect();
    drop(lines_tx);

    let mut stdout = std::io::stdout();
    let written = pump_lines(lines_rx, &mut stdout, args.max_messages, &shutdown).await?;
    info!(written, "output finished");

    shutdown.cancel();
    let closed = tap.shutdown(&feeds).await;
    for printer in printers {
        if let Err(err) = printer.await {
            warn!(error = %err, "printer task failed");
        }
    }
    info!(closed, "shutdown complete");

    Ok(())
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize tracing subscriber")?;
    Ok(())
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        shutdown_clone.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    shutdown_clone.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                }
            }
        });
    }
}
