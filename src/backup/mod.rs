pub(crate) mod archive; // Bundle creation and extraction
pub(crate) mod companions; // TimescaleDB companion files
pub(crate) mod db_dump;

use anyhow::{Context, Result};
use chrono::Local;
use std::path::PathBuf;
use tracing::info;

use crate::config::AppConfig;
use crate::utils::connection::{connect, database_url};
use crate::utils::readiness::wait_for_server;
use companions::TimescaleExport;

/// Public entry point for the backup process.
///
/// Writes `<db>.dump` and, for TimescaleDB databases, the companion files into
/// the backup mount. With `archive` everything is also bundled into
/// `<db>_<timestamp>.tar.gz`.
pub async fn run_backup_flow(app_config: &AppConfig, database: &str, archive: bool) -> Result<()> {
    wait_for_server(&app_config.admin_db_url, app_config.readiness).await?;

    let target_dir = &app_config.backup_mount_path;
    let dump_path = db_dump::dump_database(
        &app_config.admin_db_url,
        database,
        target_dir,
        app_config.passfile.as_deref(),
    )?;
    let mut files: Vec<PathBuf> = vec![dump_path];

    let db_pool = connect(&database_url(&app_config.admin_db_url, database)?).await?;
    let export = TimescaleExport::collect(&db_pool).await;
    db_pool.close().await;
    match export.with_context(|| format!("Failed to export TimescaleDB layout of '{}'", database))? {
        Some(export) => {
            info!(
                "TimescaleDB {} found: {} hypertable(s), {} continuous aggregate(s), {} job(s)",
                export.extension_version,
                export.hypertables.len(),
                export.continuous_aggregates.len(),
                export.jobs.len()
            );
            files.extend(export.write_files(target_dir, database)?);
        }
        None => info!("No TimescaleDB extension in '{}', plain backup", database),
    }

    if archive {
        let timestamp = Local::now().format("%Y-%m-%d_%H_%M_%S");
        let archive_path = target_dir.join(format!("{}_{}.tar.gz", database, timestamp));
        archive::create_bundle(&files, &archive_path)?;
        info!("📦 Backup bundle ready: {}", archive_path.display());
    }

    for file in &files {
        info!("  {}", file.display());
    }
    Ok(())
}
