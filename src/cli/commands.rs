use crate::api::{Entry, SharedEntryHandler};
use crate::cli::Commands;
use crate::config::Config;
use crate::metrics::PrometheusExporter;
use crate::targets::{classify, Kind, TargetManagers};
use anyhow::{Context, Result};
use prometheus::Registry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            config,
            stdin,
            status_interval_secs,
            metrics_file,
        } => handle_run(config, stdin, status_interval_secs, metrics_file).await,
        Commands::Check { config } => handle_check(&config),
        Commands::PrintConfig { config } => handle_print_config(&config),
    }
}

async fn handle_run(
    path: PathBuf,
    stdin: bool,
    status_interval_secs: u64,
    metrics_file: Option<PathBuf>,
) -> Result<()> {
    let mut config = Config::from_file(&path)
        .with_context(|| format!("loading config {}", path.display()))?;
    if stdin {
        config.target_config.stdin = true;
    }

    let registry = Registry::new();
    let shutdown = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<Entry>();

    let drain = tokio::spawn(async move {
        let mut shipped: u64 = 0;
        while let Some(entry) = rx.recv().await {
            match serde_json::to_string(&entry) {
                Ok(line) => {
                    println!("{}", line);
                    shipped += 1;
                }
                Err(e) => warn!("Failed to encode entry: {}", e),
            }
        }
        shipped
    });

    let handler: SharedEntryHandler = Arc::new(tx);
    let managers = TargetManagers::new(&config, &registry, handler, shutdown.clone())
        .context("starting target managers")?;
    info!("Started target managers: {}", managers.backend_names().join(", "));

    let mut status = tokio::time::interval(Duration::from_secs(status_interval_secs.max(1)));
    status.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            _ = shutdown.cancelled() => {
                info!("Input exhausted, shutting down");
                break;
            }
            _ = status.tick() => {
                log_status(&managers);
            }
        }
    }

    // Stopping blocks until every backend task has returned.
    if let Err(e) = tokio::task::spawn_blocking(move || managers.stop()).await {
        warn!("Stopping target managers failed: {}", e);
    }

    match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
        Ok(Ok(shipped)) => info!("Shipped {} entries", shipped),
        Ok(Err(e)) => warn!("Entry drain task failed: {}", e),
        Err(_) => debug!("Entry drain still has live senders, not waiting"),
    }

    if let Some(metrics_file) = metrics_file {
        PrometheusExporter::new(registry)
            .write_to(&metrics_file)
            .with_context(|| format!("writing metrics to {}", metrics_file.display()))?;
    }

    Ok(())
}

fn log_status(managers: &TargetManagers) {
    let active: usize = managers.active_targets().values().map(Vec::len).sum();
    let all: usize = managers.all_targets().values().map(Vec::len).sum();
    info!(
        ready = managers.ready(),
        active_targets = active,
        total_targets = all,
        "Target status"
    );
}

fn handle_check(path: &Path) -> Result<()> {
    let config =
        Config::from_file(path).with_context(|| format!("loading config {}", path.display()))?;
    if config.target_config.stdin {
        println!("stdin: reading a single stream, scrape configs only supply labels");
        return Ok(());
    }

    let groups = classify(&config.scrape_configs)?;
    for kind in Kind::ALL {
        if let Some(configs) = groups.get(&kind) {
            let jobs: Vec<&str> = configs.iter().map(|c| c.job_name.as_str()).collect();
            println!("{}: {}", kind, jobs.join(", "));
        }
    }
    info!("Config {} is valid", path.display());
    Ok(())
}

fn handle_print_config(path: &Path) -> Result<()> {
    let config =
        Config::from_file(path).with_context(|| format!("loading config {}", path.display()))?;
    print!("{}", config.to_yaml()?);
    Ok(())
}
