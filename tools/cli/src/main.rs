//! bwsync - scheduled encrypted exports of a Bitwarden vault.
//!
//! Runs as a long-lived service that exports the vault on a cron schedule,
//! or performs a single run on demand.

mod settings;

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use bwsync_client::{ClientProvisioner, ProcessRunner};
use bwsync_common::{ClientSettings, Settings};
use bwsync_sync::{CronSchedule, ScheduleDriver, ScheduleLoop, SyncEngine};

#[derive(Parser)]
#[command(name = "bwsync")]
#[command(about = "bwsync - Scheduled encrypted Bitwarden vault exports")]
#[command(version)]
struct Cli {
    /// Settings file (JSON or TOML); `BWSYNC_` environment variables override it.
    #[arg(short, long, default_value = "appsettings.json")]
    config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as a service, exporting on schedule (default).
    Run,

    /// Perform a single export run and exit.
    Once,

    /// Validate settings and show upcoming runs.
    Check {
        /// Number of upcoming runs to show.
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = settings::load(&cli.config)
        .with_context(|| format!("Failed to load settings ({})", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(settings).await,
        Commands::Once => cmd_once(settings).await,
        Commands::Check { count } => cmd_check(&settings, count),
    }
}

/// Run the scheduled service until interrupted.
async fn cmd_run(settings: Settings) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());

    let runner = Arc::new(prepare_runner(&settings.client, &shutdown).await?);
    let schedule = CronSchedule::parse_or_default(
        &settings.policy.cron_schedule,
        settings.policy.schedule_zone,
    );
    let run_on_startup = settings.policy.run_on_startup;
    let engine = SyncEngine::new(
        runner,
        Arc::new(settings.credentials),
        Arc::new(settings.policy),
    );

    let engine = &engine;
    let run_token = shutdown.clone();
    ScheduleLoop::new(ScheduleDriver::new(schedule), run_on_startup)
        .run(shutdown, move |now| {
            let cancel = run_token.clone();
            async move {
                engine.run_once(now, &cancel).await;
            }
        })
        .await;

    Ok(())
}

/// Perform one run; fails when any export failed.
async fn cmd_once(settings: Settings) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());

    let runner = Arc::new(prepare_runner(&settings.client, &shutdown).await?);
    let engine = SyncEngine::new(
        runner,
        Arc::new(settings.credentials),
        Arc::new(settings.policy),
    );

    let outcome = engine.run_once(Utc::now(), &shutdown).await;
    if let Some(dir) = &outcome.run_directory {
        println!("Exports written to {}", dir.display());
    }
    if !outcome.is_success() {
        anyhow::bail!(
            "Sync run failed: {} of {} export(s) written",
            outcome.exports_written(),
            outcome.exports_attempted()
        );
    }

    Ok(())
}

/// Show effective settings (without secrets) and upcoming runs.
fn cmd_check(settings: &Settings, count: usize) -> Result<()> {
    let policy = &settings.policy;
    let schedule = CronSchedule::parse_or_default(&policy.cron_schedule, policy.schedule_zone);

    println!("Settings are valid.");
    println!("  Server: {}", settings.credentials.server_url);
    println!("  Client ID: {}", settings.credentials.client_id);
    println!("  Schedule: {} ({:?})", schedule.expression(), schedule.zone());
    println!("  Run on startup: {}", policy.run_on_startup);
    println!(
        "  Organisations: {}",
        if policy.include_organisations {
            "included"
        } else {
            "skipped"
        }
    );
    println!(
        "  Encryption: {}",
        if policy.encryption_key.is_some() {
            "custom key"
        } else {
            "account key"
        }
    );
    match policy.retention {
        Some(keep) => println!("  Retention: newest {} run(s)", keep),
        None => println!("  Retention: keep all"),
    }
    println!("  Data directory: {}", policy.data_directory.display());
    match &settings.client.executable {
        Some(path) => println!("  Client: {}", path.display()),
        None => println!(
            "  Client: provisioned in {}",
            settings.client.install_directory.display()
        ),
    }

    println!("\nUpcoming runs:");
    for instant in schedule.upcoming(Utc::now(), count) {
        println!("  {}", instant.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S %Z"));
    }

    Ok(())
}

/// Locate or install the vault client and build a runner for it.
async fn prepare_runner(
    client: &ClientSettings,
    shutdown: &CancellationToken,
) -> Result<ProcessRunner> {
    let executable = match &client.executable {
        Some(path) => {
            anyhow::ensure!(
                path.is_file(),
                "Configured vault client {} does not exist",
                path.display()
            );
            info!("Using configured vault client {}", path.display());
            path.clone()
        }
        None => ClientProvisioner::new(client.install_directory.clone())
            .context("Failed to prepare client provisioning")?
            .ensure_available(shutdown)
            .await
            .context("Failed to provision the vault client")?,
    };

    Ok(ProcessRunner::new(executable, client.command_timeout))
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
fn spawn_shutdown_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested, stopping...");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
