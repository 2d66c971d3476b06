//! Write ledger cleaner service
//!
//! Periodically reconciles the write records of every insert-only table:
//! aborts writes whose writer went away, deletes the artifacts of aborted
//! writes and advances the watermarks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cleaner::{CleanerScheduler, ObjectStoreArtifactLocator, SystemClock};
use common::config::{Configuration, DEFAULT_CONFIG_FILE};
use common::storage::{artifact_root, create_object_store};
use common::writes::SqlWriteStore;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Default)]
enum Command {
    /// Run the cleaner until SIGINT or SIGTERM (default)
    #[default]
    Start,
    /// Run a single sweep over all tables and exit
    Sweep,
    /// Show the effective configuration and exit
    Config,
    /// Validate the configuration and exit
    Validate,
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        "warn"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<&Path>) -> Result<Configuration> {
    match path {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            Configuration::load_from_path(path)
                .map_err(|e| *e)
                .context("Failed to load configuration")
        }
        None => {
            if !Path::new(DEFAULT_CONFIG_FILE).exists() {
                tracing::info!("{DEFAULT_CONFIG_FILE} not found, using defaults and environment");
            }
            Configuration::load()
                .map_err(|e| *e)
                .context("Failed to load configuration")
        }
    }
}

fn display_config(config: &Configuration) {
    let cleaner = &config.cleaner;
    println!("Write ledger configuration:");
    println!("===========================");
    println!("Database DSN: {}", config.database.dsn);
    println!("Storage DSN: {}", config.storage.dsn);
    println!("Artifact root: '{}'", config.storage.artifact_root);
    println!("Cleaner enabled: {}", cleaner.enabled);
    println!("Heartbeat timeout: {:?}", cleaner.heartbeat_timeout);
    println!("Absolute timeout: {:?}", cleaner.absolute_timeout);
    println!("Aborted grace period: {:?}", cleaner.aborted_grace_period);
    println!("Poll interval: {:?}", cleaner.poll_interval);
    println!("Max concurrent tables: {}", cleaner.max_concurrent_tables);
    println!(
        "Pass timeout: {:?} + {:?} per pending write",
        cleaner.pass_timeout_base, cleaner.pass_timeout_per_write
    );
    println!(
        "Report unaccounted artifacts: {}",
        cleaner.report_unaccounted_artifacts
    );
}

async fn build_scheduler(config: &Configuration) -> Result<CleanerScheduler> {
    let store = SqlWriteStore::connect(&config.database.dsn)
        .await
        .context("Failed to connect to write-record store")?;
    let object_store =
        create_object_store(&config.storage).context("Failed to open artifact store")?;
    let locator = ObjectStoreArtifactLocator::new(object_store, artifact_root(&config.storage));

    CleanerScheduler::new(
        config.cleaner.clone(),
        Arc::new(store),
        Arc::new(locator),
        Arc::new(SystemClock),
    )
    .context("Invalid cleaner timeouts")
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        tracing::info!("Received Ctrl+C");
    }

    Ok(())
}

async fn run_service(config: Configuration) -> Result<()> {
    if !config.cleaner.enabled {
        tracing::info!("Cleaner is disabled in configuration (cleaner.enabled = false)");
        tracing::info!("Set WRITELEDGER__CLEANER__ENABLED=true or enable it in the config file");
        return Ok(());
    }

    let scheduler = Arc::new(build_scheduler(&config).await?);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let cleaner_task = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    tracing::info!("Cleaner service running, waiting for shutdown signal");
    wait_for_shutdown_signal().await?;

    tracing::info!("Received shutdown signal, stopping cleaner service");
    // The task may already be gone if it panicked
    let _ = shutdown_tx.send(());
    cleaner_task.await.context("Cleaner task failed")?;

    tracing::info!("Cleaner service stopped");
    Ok(())
}

async fn run_single_sweep(config: Configuration) -> Result<()> {
    let scheduler = build_scheduler(&config).await?;
    let sweep = scheduler
        .run_one_iteration()
        .await
        .context("Failed to list tables with pending writes")?;

    for pass in &sweep.passes {
        tracing::info!(
            table = %pass.table,
            aborted = pass.aborted_ids.len(),
            deleted = pass.deleted_ids.len(),
            failed_deletions = pass.failed_deletions.len(),
            watermark = pass.new_watermark,
            "Pass complete"
        );
    }
    for failure in &sweep.failures {
        tracing::error!(table = %failure.table, fatal = failure.fatal, "{}", failure.error);
    }
    scheduler.metrics().summary().log();

    if !sweep.failures.is_empty() {
        anyhow::bail!("{} table(s) failed to reconcile", sweep.failures.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = load_config(cli.config.as_deref())?;

    match cli.command.clone().unwrap_or_default() {
        Command::Start => {
            config.cleaner.validate()?;
            run_service(config).await
        }
        Command::Sweep => {
            config.cleaner.validate()?;
            run_single_sweep(config).await
        }
        Command::Config => {
            display_config(&config);
            Ok(())
        }
        Command::Validate => {
            config.cleaner.validate()?;
            tracing::info!("Configuration validation passed");
            Ok(())
        }
    }
}
