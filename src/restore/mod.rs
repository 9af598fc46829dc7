pub(crate) mod artifacts; // Backup references, bundles and companion files
pub(crate) mod db_restore; // Server side of the restore: databases, pg_restore, psql
pub(crate) mod detect;
pub(crate) mod diagnostics;
pub(crate) mod grants;
mod logic; // Restore state machine
pub(crate) mod marker;
pub(crate) mod roles;
pub(crate) mod verification;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::{AppConfig, RestoreJob};
use crate::utils::connection::{connect, database_url};
use crate::utils::readiness::wait_for_server;
use db_restore::PgBackend;
use logic::{RestoreOptions, RestoreOrchestrator, RestoreState, StepStatus};
use marker::MarkerStore;

/// Public entry point for the restore process.
///
/// Waits for the server, runs the restore state machine, applies grants and
/// prints the report. Returns an error when the run ends in `Failed`, after
/// the report has been printed.
pub async fn run_restore_flow(app_config: &AppConfig, job: &RestoreJob) -> Result<()> {
    wait_for_server(&app_config.admin_db_url, app_config.readiness).await?;

    let admin_pool = connect(&app_config.admin_db_url).await?;
    let markers = MarkerStore::new(&app_config.data_directory);
    let options = RestoreOptions {
        jobs: app_config.restore_jobs,
        force_parallel: app_config.force_parallel_restore,
        failure_policy: app_config.failure_policy,
    };
    let mut orchestrator =
        RestoreOrchestrator::new(PgBackend::new(app_config, admin_pool), &markers, options);
    let outcome = orchestrator
        .run(job, &app_config.backup_mount_path)
        .await
        .with_context(|| format!("Restore of '{}' failed", job.database))?;
    orchestrator.into_backend().close().await;

    for step in &outcome.steps {
        match &step.status {
            StepStatus::Applied { count } => info!("  {}: {} restored", step.step, count),
            StepStatus::NotPresent => info!("  {}: no script", step.step),
            StepStatus::VerificationFailed { suspicious_lines } => warn!(
                "  {}: nothing in catalog after script ({} unexpected message(s))",
                step.step, suspicious_lines
            ),
            StepStatus::Error(e) => warn!("  {}: {}", step.step, e),
        }
    }

    let target_url = database_url(&app_config.admin_db_url, &job.database)?;
    let db_pool = connect(&target_url).await?;
    if outcome.dump_restored {
        grants::apply_grants(&db_pool, &outcome.roles, outcome.has_hypertables)
            .await
            .context("Privilege grants failed")?;
    } else {
        info!("Nothing restored in this run, skipping privilege grants");
    }

    let report = verification::build_report(
        &db_pool,
        &job.database,
        app_config.report_table_limit,
        outcome.has_hypertables,
    )
    .await;
    db_pool.close().await;
    println!("{}", report);

    match outcome.state {
        RestoreState::Failed => Err(anyhow::anyhow!(
            outcome
                .failure
                .unwrap_or_else(|| format!("Restore of '{}' failed", job.database))
        )),
        state => {
            info!("Restore of '{}' finished: {}", job.database, state);
            Ok(())
        }
    }
}

/// Prints the report for an existing database without changing anything.
pub async fn run_report(app_config: &AppConfig, database: &str, limit: Option<i64>) -> Result<()> {
    wait_for_server(&app_config.admin_db_url, app_config.readiness).await?;
    let db_pool = connect(&database_url(&app_config.admin_db_url, database)?).await?;
    let report = verification::build_report(
        &db_pool,
        database,
        limit.unwrap_or(app_config.report_table_limit),
        true,
    )
    .await;
    db_pool.close().await;
    println!("{}", report);
    Ok(())
}
