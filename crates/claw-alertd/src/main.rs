//! claw-alertd - Clawbernetes alert dispatch daemon
//!
//! Reads alerts as newline-delimited JSON on stdin, groups and routes them
//! according to a configuration file, and delivers notifications to the
//! configured receivers. `SIGHUP` reloads the configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use claw_dispatch::{
    Alert, AlertProvider, Config, Coordinator, MemAlerts, MemNotificationLog, MemSilences, Stores,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "claw-alertd")]
#[command(about = "Clawbernetes alert dispatch daemon")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, env = "CLAW_ALERTD_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher, reading alerts from stdin
    Run {
        /// Path to config file
        #[arg(short, long = "config-file", env = "CLAW_ALERTD_CONFIG", default_value = "/etc/claw-alertd/config.json")]
        config: PathBuf,

        /// Seconds between sweeps of long-resolved alerts
        #[arg(long, default_value_t = 300)]
        gc_interval_secs: u64,
    },

    /// Validate a config file and exit
    Check {
        /// Path to config file
        #[arg(short, long = "config-file", default_value = "/etc/claw-alertd/config.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    match cli.command {
        Commands::Run {
            config,
            gc_interval_secs,
        } => run(config, Duration::from_secs(gc_interval_secs.max(1))).await,
        Commands::Check { config } => check(&config),
    }
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = Config::load_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config.validate().context("invalid configuration")?;
    info!(
        receivers = config.receivers.len(),
        inhibit_rules = config.inhibit_rules.len(),
        "configuration is valid"
    );
    Ok(())
}

async fn run(config_path: PathBuf, gc_interval: Duration) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting claw-alertd");

    let config = Config::load_file(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let alerts = Arc::new(MemAlerts::new());
    let coordinator = Arc::new(Coordinator::new(Stores {
        alerts: Arc::clone(&alerts) as Arc<dyn AlertProvider>,
        silences: Arc::new(MemSilences::new()),
        notification_log: Arc::new(MemNotificationLog::new()),
    }));
    coordinator
        .apply(&config)
        .await
        .context("failed to apply configuration")?;

    let ingest = tokio::spawn(ingest(Arc::clone(&alerts)));
    let gc = tokio::spawn(collect_resolved(Arc::clone(&alerts), gc_interval));

    wait_for_shutdown(&coordinator, &config_path).await?;

    info!("shutting down");
    ingest.abort();
    gc.abort();
    coordinator.shutdown().await;
    Ok(())
}

/// Reads one JSON alert per line from stdin until EOF.
async fn ingest(alerts: Arc<MemAlerts>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match serde_json::from_str::<Alert>(&line) {
                Ok(alert) => {
                    if let Err(e) = alerts.put(vec![alert]) {
                        error!(error = %e, "failed to store alert");
                    }
                }
                Err(e) => warn!(error = %e, "skipping malformed alert"),
            },
            Ok(None) => {
                info!("alert input closed");
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to read alert input");
                return;
            }
        }
    }
}

async fn collect_resolved(alerts: Arc<MemAlerts>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let removed = alerts.gc(chrono::Utc::now());
        if removed > 0 {
            info!(removed, "removed resolved alerts");
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown(coordinator: &Coordinator, config_path: &Path) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!(config = %config_path.display(), "reloading configuration");
                match coordinator.reload_file(config_path).await {
                    Ok(generation) => info!(generation, "configuration reloaded"),
                    Err(e) => error!(error = %e, "reload failed, keeping previous configuration"),
                }
            }
            _ = terminate.recv() => return Ok(()),
            result = tokio::signal::ctrl_c() => {
                return result.context("failed to listen for ctrl-c");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_coordinator: &Coordinator, _config_path: &Path) -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")
}
