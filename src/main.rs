use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use emfrelay::batch::file::{FileBatcher, FileBatcherConfig};
use emfrelay::config::{self, ServiceCatalog, Settings};
use emfrelay::handlers::{IngestHandler, IngestRecord};
use emfrelay::sink::flush::Flusher;
use emfrelay::sink::http::HttpLogsClient;
use emfrelay::sink::{self, SharedLogsClient};

/// Multi-region EMF metric relay.
#[derive(Parser)]
#[command(name = "emfrelay", about)]
struct Cli {
    /// Logging verbosity level (debug, info, warn, error). Overrides
    /// LOG_LEVEL.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("emfrelay {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let settings = Settings::from_env().context("loading settings from environment")?;

    let level = match &cli.log_level {
        Some(raw) => config::normalize_log_level(Some(raw)),
        None => settings.log_level.clone(),
    };
    let filter =
        EnvFilter::try_new(&level).with_context(|| format!("invalid log level: {level}"))?;
    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        regions = ?settings.regions,
        group = %settings.log_group,
        "starting emfrelay",
    );

    // The catalogue is validated at boot even though the ingest path does
    // not consume it; a malformed document should fail fast here.
    if let Some(path) = &settings.layer_path {
        ServiceCatalog::load(path).context("loading service catalogue")?;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(settings))
}

async fn run(settings: Settings) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Bootstrap sink resources across all regions. Failure here is fatal.
    let stream = sink::stream_name();
    let sink_cfg = settings.sink_config();
    let clients = sink::bootstrap_regions(&settings.regions, &settings.log_group, &stream, |region| {
        Ok(Arc::new(HttpLogsClient::new(region, sink_cfg.clone())?) as SharedLogsClient)
    })
    .await
    .context("ensuring log group and stream across regions")?;

    let flusher = Arc::new(Flusher::new(
        Arc::new(clients),
        settings.log_group.clone(),
        stream,
    ));

    let cancel = CancellationToken::new();
    let mut batcher_cfg = FileBatcherConfig::new(settings.namespace.clone(), std::env::temp_dir());
    batcher_cfg.max_count = config::MAX_BATCH_EVENTS;
    batcher_cfg.max_bytes = config::MAX_BATCH_BYTES as u64;
    batcher_cfg.flush_interval = settings.flush_interval;

    let batcher = FileBatcher::new(batcher_cfg, flusher, cancel.clone());

    // Flush whatever a previous process pass left staged.
    batcher.recover().await.context("recovering stage files")?;

    let batcher = {
        let shared = Arc::new(batcher);
        let handler = IngestHandler::new(Arc::clone(&shared));

        // Ingest loop: one NDJSON audit event per stdin line.
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut sequence = 0u64;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        sequence += 1;
                        let failures = handler
                            .handle(vec![IngestRecord {
                                id: sequence.to_string(),
                                body: line,
                            }])
                            .await;
                        if !failures.is_empty() {
                            tracing::warn!(failed = failures.len(), "undeliverable records");
                        }
                    }
                    Ok(None) => {
                        tracing::info!("ingest input closed");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "reading ingest input");
                        break;
                    }
                },
            }
        }

        shared
    };

    // Graceful shutdown: drain every region, then cancel.
    match Arc::try_unwrap(batcher) {
        Ok(mut batcher) => batcher.stop().await,
        Err(_) => tracing::warn!("file batcher still shared at shutdown"),
    }

    tracing::info!("emfrelay stopped");

    Ok(())
}
