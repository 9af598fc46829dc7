// restoretool/src/restore/logic.rs
//! The restore state machine.
//!
//! `NotStarted -> Skipped` when the database already carries a restore marker,
//! otherwise `NotStarted -> Restoring -> Completed | Failed`. Every side effect
//! goes through [`RestoreBackend`], so the sequencing can be exercised without
//! a running server. Nothing about the backup is touched before the marker
//! check: a skipped run neither unpacks bundles nor lists the dump.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::config::{FailurePolicy, RestoreJob};
use crate::restore::artifacts::{Companions, DumpLocation, ResolvedBackup};
use crate::restore::detect::{BackupClass, ClassificationReason, TableOfContents, classify};
use crate::restore::diagnostics::log_diagnostics;
use crate::restore::marker::{MarkerRecord, MarkerStore};
use crate::timescale::SupplementaryStep;
use crate::utils::ToolOutput;

/// Counts user tables outside the system and TimescaleDB schemas.
pub const USER_TABLE_COUNT_QUERY: &str = "SELECT count(*)::bigint FROM information_schema.tables
     WHERE table_type = 'BASE TABLE'
       AND table_schema NOT IN ('pg_catalog', 'information_schema')
       AND table_schema NOT LIKE '\\_timescaledb%'
       AND table_schema NOT LIKE 'timescaledb\\_%'";

/// Side effects the orchestrator needs from the database server and the client tools.
#[allow(async_fn_in_trait)]
pub trait RestoreBackend {
    /// Makes sure every role exists before the dump references them.
    async fn provision_roles(&mut self, roles: &[String]) -> Result<()>;
    /// Table of contents of `dump` (`pg_restore --list`).
    fn list_toc(&mut self, dump: &DumpLocation) -> Result<TableOfContents>;
    async fn database_exists(&mut self, database: &str) -> Result<bool>;
    async fn create_database(&mut self, database: &str) -> Result<()>;
    /// Terminates other sessions on `database`, then drops it.
    async fn drop_database(&mut self, database: &str) -> Result<()>;
    async fn grant_connect(&mut self, database: &str, roles: &[String]) -> Result<()>;
    /// `CREATE EXTENSION IF NOT EXISTS timescaledb CASCADE` inside `database`.
    async fn create_extension(&mut self, database: &str) -> Result<()>;
    async fn restore_dump(
        &mut self,
        database: &str,
        dump: &DumpLocation,
        jobs: Option<u32>,
    ) -> Result<ToolOutput>;
    async fn apply_sql_file(&mut self, database: &str, path: &Path) -> Result<ToolOutput>;
    async fn count(&mut self, database: &str, query: &str) -> Result<i64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    NotStarted,
    Skipped,
    Restoring,
    Completed,
    Failed,
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RestoreState::NotStarted => "not started",
            RestoreState::Skipped => "skipped",
            RestoreState::Restoring => "restoring",
            RestoreState::Completed => "completed",
            RestoreState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    /// The catalog shows `count` objects after the script ran.
    Applied { count: i64 },
    /// No companion file for this step.
    NotPresent,
    /// The script ran but the catalog still shows nothing.
    VerificationFailed { suspicious_lines: usize },
    Error(String),
}

impl StepStatus {
    fn is_failure(&self) -> bool {
        matches!(self, StepStatus::VerificationFailed { .. } | StepStatus::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub step: SupplementaryStep,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Copy)]
pub struct RestoreOptions {
    pub jobs: Option<u32>,
    pub force_parallel: bool,
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub state: RestoreState,
    pub transitions: Vec<RestoreState>,
    pub dump_restored: bool,
    pub steps: Vec<StepOutcome>,
    pub marker: Option<PathBuf>,
    pub failure: Option<String>,
    /// Roles provisioned for this run; empty when skipped.
    pub roles: Vec<String>,
    /// From this run's classification, or from the marker when skipped.
    pub has_hypertables: bool,
}

/// Job count handed to pg_restore.
///
/// Parallel restore is turned off for hypertable-bearing dumps because the
/// extension's catalog tables reference each other, unless explicitly forced.
pub fn effective_jobs(configured: Option<u32>, has_hypertables: bool, force_parallel: bool) -> Option<u32> {
    match configured {
        Some(jobs) if jobs > 1 && has_hypertables && !force_parallel => {
            warn!(
                "⚠️ Ignoring PG_RESTORE_JOBS={} for a hypertable-bearing dump (set FORCE_PARALLEL_RESTORE to override)",
                jobs
            );
            None
        }
        Some(jobs) if jobs > 1 => Some(jobs),
        _ => None,
    }
}

pub struct RestoreOrchestrator<'m, B> {
    backend: B,
    markers: &'m MarkerStore,
    options: RestoreOptions,
    state: RestoreState,
    transitions: Vec<RestoreState>,
    roles: Vec<String>,
    has_hypertables: bool,
}

impl<'m, B: RestoreBackend> RestoreOrchestrator<'m, B> {
    pub fn new(backend: B, markers: &'m MarkerStore, options: RestoreOptions) -> Self {
        RestoreOrchestrator {
            backend,
            markers,
            options,
            state: RestoreState::NotStarted,
            transitions: vec![RestoreState::NotStarted],
            roles: Vec::new(),
            has_hypertables: false,
        }
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    fn transition(&mut self, next: RestoreState) {
        info!("Restore state: {} -> {}", self.state, next);
        self.state = next;
        self.transitions.push(next);
    }

    fn outcome(
        &self,
        dump_restored: bool,
        steps: Vec<StepOutcome>,
        marker: Option<PathBuf>,
        failure: Option<String>,
    ) -> RestoreOutcome {
        RestoreOutcome {
            state: self.state,
            transitions: self.transitions.clone(),
            dump_restored,
            steps,
            marker,
            failure,
            roles: self.roles.clone(),
            has_hypertables: self.has_hypertables,
        }
    }

    fn fail(
        &mut self,
        reason: String,
        dump_restored: bool,
        steps: Vec<StepOutcome>,
    ) -> RestoreOutcome {
        error!("❌ {}", reason);
        self.transition(RestoreState::Failed);
        self.outcome(dump_restored, steps, None, Some(reason))
    }

    /// The marker record left by an earlier run, logged for the operator.
    fn prior_record(&self, database: &str) -> Option<MarkerRecord> {
        match self.markers.read(database) {
            Ok(Some(record)) => {
                info!(
                    "'{}' was restored from {} at {}",
                    database, record.backup, record.completed_at
                );
                Some(record)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("⚠️ {:#}", e);
                None
            }
        }
    }

    /// Runs the state machine once for `job`, resolving its backup against `mount_path`.
    ///
    /// Errors while preparing (artifact resolution, roles, drop, create, grants,
    /// extension) are returned as `Err`. Problems with the restore itself end in
    /// `Failed` and are reported through the outcome so that reporting can still run.
    pub async fn run(&mut self, job: &RestoreJob, mount_path: &Path) -> Result<RestoreOutcome> {
        let database = job.database.as_str();
        let _lock = self.markers.lock(database)?;

        let marker_exists = self.markers.exists(database);
        if marker_exists && !job.force {
            self.has_hypertables = self
                .prior_record(database)
                .is_some_and(|record| record.has_hypertables);
            info!(
                "⏭ '{}' was already restored ({}), skipping. Pass 'force' to restore again.",
                database,
                self.markers.marker_path(database).display()
            );
            self.transition(RestoreState::Skipped);
            return Ok(self.outcome(false, Vec::new(), None, None));
        }

        self.transition(RestoreState::Restoring);
        if marker_exists {
            self.prior_record(database);
        }

        let resolved = ResolvedBackup::resolve(mount_path, database, &job.backup_reference)?;
        self.roles = match &job.roles {
            Some(roles) => roles.clone(),
            None => resolved.companions.read_roles()?.unwrap_or_default(),
        };
        info!("Roles for '{}': {:?}", database, self.roles);
        self.backend
            .provision_roles(&self.roles)
            .await
            .context("Role provisioning failed")?;

        let mut expected_tables = 0;
        let class = match resolved.dump.as_ref() {
            Some(dump) => {
                let backend = &mut self.backend;
                classify(resolved.companions.has_metadata(), || {
                    let toc = backend.list_toc(dump)?;
                    expected_tables = toc.user_table_count();
                    Ok(toc)
                })
            }
            None => BackupClass {
                has_hypertables: false,
                reason: ClassificationReason::Plain,
            },
        };
        self.has_hypertables = class.has_hypertables;

        let exists = self
            .backend
            .database_exists(database)
            .await
            .with_context(|| format!("Failed to check whether '{}' exists", database))?;
        if job.force {
            if marker_exists {
                self.markers.remove(database)?;
            }
            if exists {
                info!("♻️ Force restore: recreating '{}' from scratch", database);
                self.backend.drop_database(database).await?;
            }
            self.backend.create_database(database).await?;
        } else if !exists {
            self.backend.create_database(database).await?;
        }
        let roles = self.roles.clone();
        self.backend.grant_connect(database, &roles).await?;

        let Some(dump) = resolved.dump.as_ref() else {
            return Ok(self.fail(
                format!(
                    "Backup '{}' not found, nothing restored into '{}'",
                    job.backup_reference, database
                ),
                false,
                Vec::new(),
            ));
        };

        let has_hypertables = class.has_hypertables;
        if has_hypertables {
            info!("Creating TimescaleDB extension before restore");
            self.backend.create_extension(database).await?;
        }

        let jobs = effective_jobs(self.options.jobs, has_hypertables, self.options.force_parallel);
        info!("🔄 Restoring {} into '{}' (jobs: {})", dump.path.display(), database, jobs.unwrap_or(1));
        let output = match self.backend.restore_dump(database, dump, jobs).await {
            Ok(output) => output,
            Err(e) => return Ok(self.fail(format!("pg_restore could not run: {:#}", e), false, Vec::new())),
        };
        if !output.success {
            let suspicious = log_diagnostics("pg_restore", &output.stderr);
            warn!(
                "⚠️ pg_restore exited with {} ({} unexpected message(s)), verifying against the catalog",
                output.status, suspicious
            );
        }

        // Only known when the TOC was listed; a metadata-classified dump skips this check.
        if expected_tables > 0 {
            let restored = self.backend.count(database, USER_TABLE_COUNT_QUERY).await.unwrap_or_else(|e| {
                warn!("⚠️ Could not count restored tables: {:#}", e);
                0
            });
            if restored == 0 {
                let reason = format!(
                    "Dump lists {} table(s) but '{}' has none after pg_restore",
                    expected_tables, database
                );
                if self.options.failure_policy == FailurePolicy::Abort {
                    return Ok(self.fail(reason, true, Vec::new()));
                }
                warn!("⚠️ {} (continuing per failure policy)", reason);
            } else {
                info!("✓ {} table(s) present after pg_restore", restored);
            }
        }

        let mut steps = Vec::new();
        if has_hypertables {
            for step in SupplementaryStep::ORDERED {
                let status = self.apply_step(database, &resolved.companions, step).await;
                let failed = status.is_failure();
                steps.push(StepOutcome { step, status });
                if failed {
                    if self.options.failure_policy == FailurePolicy::Abort {
                        return Ok(self.fail(
                            format!("Restoring {} failed verification", step),
                            true,
                            steps,
                        ));
                    }
                    warn!("⚠️ Restoring {} failed verification, continuing per failure policy", step);
                }
            }
        }

        let marker = self.markers.write(&MarkerRecord {
            database: database.to_string(),
            backup: job.backup_reference.clone(),
            has_hypertables,
            completed_at: Utc::now(),
        })?;
        self.transition(RestoreState::Completed);
        info!("✅ Restore of '{}' completed", database);
        Ok(self.outcome(true, steps, Some(marker), None))
    }

    async fn apply_step(
        &mut self,
        database: &str,
        companions: &Companions,
        step: SupplementaryStep,
    ) -> StepStatus {
        let Some(path) = companions.step_file(step) else {
            info!("No {} script, skipping", step);
            return StepStatus::NotPresent;
        };

        info!("Applying {} from {}", step, path.display());
        let suspicious_lines = match self.backend.apply_sql_file(database, &path).await {
            Ok(output) => log_diagnostics(&step.to_string(), &output.stderr),
            Err(e) => return StepStatus::Error(format!("{:#}", e)),
        };

        match self.backend.count(database, step.verification_query()).await {
            Ok(count) if count > 0 => {
                info!("✓ {} restored ({} in catalog)", step, count);
                StepStatus::Applied { count }
            }
            Ok(_) => StepStatus::VerificationFailed { suspicious_lines },
            Err(e) => StepStatus::Error(format!("{:#}", e)),
        }
    }
}
