//! PostgreSQL/TimescaleDB restore tool
//!
//! Provides CLI interface for restore, backup, readiness and report operations

// restoretool/src/main.rs
mod backup;
mod cli;
mod config;
mod errors;
mod restore;
mod timescale;
mod utils;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use config::{AppConfig, RestoreJob};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use utils::connection::{get_db_name_from_url, redact_url};

/// Main entry point for the restore tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_level(true)
                .with_target(false),
        )
        .init();

    let cli = Cli::parse();
    match run_app(cli).await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    let app_config = AppConfig::load(cli.config.as_deref())
        .context("Failed to load application configuration")?;
    info!(
        admin_database = %get_db_name_from_url(&app_config.admin_db_url).unwrap_or_default(),
        server = %redact_url(&app_config.admin_db_url),
        backups = %app_config.backup_mount_path.display(),
        markers = %app_config.data_directory.display(),
        "Configuration loaded"
    );

    match cli.command {
        Commands::Restore {
            database,
            backup,
            roles,
            force,
        } => {
            let job = RestoreJob::from_args(&database, &backup, roles.as_deref(), force.as_deref())?;
            info!("🔄 Starting restore of {} into '{}'...", job.backup_reference, job.database);
            restore::run_restore_flow(&app_config, &job)
                .await
                .context("Restore process failed")?;
        }
        Commands::Backup { database, archive } => {
            info!("🚀 Starting backup of '{}'...", database);
            backup::run_backup_flow(&app_config, &database, archive)
                .await
                .context("Backup process failed")?;
        }
        Commands::Wait => {
            utils::readiness::wait_for_server(&app_config.admin_db_url, app_config.readiness).await?;
        }
        Commands::Report { database, limit } => {
            restore::run_report(&app_config, &database, limit)
                .await
                .context("Report failed")?;
        }
    }
    Ok(())
}
