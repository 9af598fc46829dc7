// restoretool/src/restore/db_restore.rs
use anyhow::{Context, Result};
use sqlx::{Pool, Postgres};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::restore::artifacts::DumpLocation;
use crate::restore::detect::TableOfContents;
use crate::restore::logic::RestoreBackend;
use crate::restore::roles;
use crate::timescale::EXTENSION_NAME;
use crate::utils::connection::{connect, database_url};
use crate::utils::sql::quote_ident;
use crate::utils::{PgTool, ToolOutput, run_pg_tool};

/// Lists the table of contents of a dump with `pg_restore --list`.
pub fn list_toc(dump: &DumpLocation, passfile: Option<&Path>) -> Result<TableOfContents> {
    let output = run_pg_tool(
        PgTool::PgRestore,
        [OsString::from("--list"), dump.path.clone().into_os_string()],
        passfile,
    )?;
    if !output.success {
        return Err(output.into_error(PgTool::PgRestore))
            .with_context(|| format!("Failed to list {}", dump.path.display()));
    }
    let toc = TableOfContents::parse(&output.stdout);
    debug!("{} TOC entries in {}", toc.entries.len(), dump.path.display());
    Ok(toc)
}

/// Arguments for `pg_restore` into `target_db_url`.
pub fn pg_restore_args(target_db_url: &str, dump: &DumpLocation, jobs: Option<u32>) -> Vec<OsString> {
    let mut args = vec![
        OsString::from("--dbname"),
        OsString::from(target_db_url),
        OsString::from("--no-password"),
    ];
    if let Some(jobs) = jobs {
        args.push(OsString::from("--jobs"));
        args.push(OsString::from(jobs.to_string()));
    }
    args.push(dump.path.clone().into_os_string());
    args
}

/// Arguments for running a SQL file with `psql`.
///
/// `ON_ERROR_STOP` stays off: the supplementary scripts hit expected errors
/// and are verified against the catalog afterwards.
pub fn psql_file_args(target_db_url: &str, sql_file_path: &Path) -> Vec<OsString> {
    vec![
        OsString::from("-X"), // Do not read psqlrc
        OsString::from("-q"),
        OsString::from("--no-password"),
        OsString::from("-v"),
        OsString::from("ON_ERROR_STOP=0"),
        OsString::from("-d"),
        OsString::from(target_db_url),
        OsString::from("-f"),
        sql_file_path.as_os_str().to_os_string(),
    ]
}

/// [`RestoreBackend`] against a live server.
///
/// Keeps one admin pool on the maintenance database and a lazily opened pool
/// on the restore target.
pub struct PgBackend {
    admin_db_url: String,
    passfile: Option<PathBuf>,
    default_role_password: Option<String>,
    admin_pool: Pool<Postgres>,
    target: Option<(String, Pool<Postgres>)>,
}

impl PgBackend {
    pub fn new(config: &AppConfig, admin_pool: Pool<Postgres>) -> Self {
        PgBackend {
            admin_db_url: config.admin_db_url.clone(),
            passfile: config.passfile.clone(),
            default_role_password: config.default_role_password.clone(),
            admin_pool,
            target: None,
        }
    }

    async fn target_pool(&mut self, database: &str) -> Result<&Pool<Postgres>> {
        let stale = matches!(&self.target, Some((name, _)) if name != database);
        if stale {
            self.close_target().await;
        }
        if self.target.is_none() {
            let url = database_url(&self.admin_db_url, database)?;
            self.target = Some((database.to_string(), connect(&url).await?));
        }
        self.target
            .as_ref()
            .map(|(_, pool)| pool)
            .context("Target pool unavailable")
    }

    async fn close_target(&mut self) {
        if let Some((name, pool)) = self.target.take() {
            debug!("Closing pool on '{}'", name);
            pool.close().await;
        }
    }

    pub async fn close(mut self) {
        self.close_target().await;
        self.admin_pool.close().await;
    }
}

impl RestoreBackend for PgBackend {
    async fn provision_roles(&mut self, roles: &[String]) -> Result<()> {
        let summary =
            roles::provision_roles(&self.admin_pool, roles, self.default_role_password.as_deref()).await?;
        info!(
            "Roles created: {:?}, already present: {:?}",
            summary.created, summary.existing
        );
        Ok(())
    }

    fn list_toc(&mut self, dump: &DumpLocation) -> Result<TableOfContents> {
        list_toc(dump, self.passfile.as_deref())
    }

    async fn database_exists(&mut self, database: &str) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(database)
            .fetch_one(&self.admin_pool)
            .await
            .with_context(|| format!("Failed to check existence of database '{}'", database))
    }

    async fn create_database(&mut self, database: &str) -> Result<()> {
        info!("Creating database '{}'...", database);
        sqlx::query(&format!("CREATE DATABASE {}", quote_ident(database)?))
            .execute(&self.admin_pool)
            .await
            .with_context(|| format!("Failed to create database '{}'", database))?;
        info!("✓ Database '{}' created.", database);
        Ok(())
    }

    async fn drop_database(&mut self, database: &str) -> Result<()> {
        self.close_target().await;
        info!("Dropping database '{}'...", database);
        sqlx::query(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1 AND pid <> pg_backend_pid()",
        )
        .bind(database)
        .execute(&self.admin_pool)
        .await
        .with_context(|| {
            format!(
                "Failed to terminate connections to database '{}'. This might require superuser privileges.",
                database
            )
        })?;
        sqlx::query(&format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", quote_ident(database)?))
            .execute(&self.admin_pool)
            .await
            .with_context(|| format!("Failed to drop database '{}'", database))?;
        info!("✓ Database '{}' dropped.", database);
        Ok(())
    }

    async fn grant_connect(&mut self, database: &str, roles: &[String]) -> Result<()> {
        roles::grant_connect(&self.admin_pool, database, roles).await
    }

    async fn create_extension(&mut self, database: &str) -> Result<()> {
        let statement = format!(
            "CREATE EXTENSION IF NOT EXISTS {} CASCADE",
            quote_ident(EXTENSION_NAME)?
        );
        let pool = self.target_pool(database).await?;
        sqlx::query(&statement)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to create extension {} in '{}'", EXTENSION_NAME, database))?;
        info!("✓ Extension {} ready in '{}'", EXTENSION_NAME, database);
        Ok(())
    }

    async fn restore_dump(
        &mut self,
        database: &str,
        dump: &DumpLocation,
        jobs: Option<u32>,
    ) -> Result<ToolOutput> {
        let url = database_url(&self.admin_db_url, database)?;
        let output = run_pg_tool(
            PgTool::PgRestore,
            pg_restore_args(&url, dump, jobs),
            self.passfile.as_deref(),
        )
        .with_context(|| format!("Failed to execute pg_restore for '{}'", database))?;
        if output.success {
            info!("✓ pg_restore finished for '{}'", database);
        }
        Ok(output)
    }

    async fn apply_sql_file(&mut self, database: &str, path: &Path) -> Result<ToolOutput> {
        let url = database_url(&self.admin_db_url, database)?;
        run_pg_tool(PgTool::Psql, psql_file_args(&url, path), self.passfile.as_deref())
            .with_context(|| format!("Failed to execute psql with {}", path.display()))
    }

    async fn count(&mut self, database: &str, query: &str) -> Result<i64> {
        let pool = self.target_pool(database).await?;
        sqlx::query_scalar::<_, i64>(query)
            .fetch_one(pool)
            .await
            .with_context(|| format!("Catalog query failed in '{}'", database))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::artifacts::DumpFormat;

    fn dump() -> DumpLocation {
        DumpLocation {
            path: PathBuf::from("/backups/orders_db.dump"),
            format: DumpFormat::Custom,
        }
    }

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn pg_restore_single_job() {
        assert_eq!(
            strings(pg_restore_args("postgres://postgres@db/orders_db", &dump(), None)),
            vec![
                "--dbname",
                "postgres://postgres@db/orders_db",
                "--no-password",
                "/backups/orders_db.dump",
            ]
        );
    }

    #[test]
    fn pg_restore_parallel_jobs() {
        let args = strings(pg_restore_args("postgres://postgres@db/orders_db", &dump(), Some(4)));
        assert_eq!(&args[3..5], &["--jobs".to_string(), "4".to_string()]);
        assert_eq!(args.last().map(String::as_str), Some("/backups/orders_db.dump"));
    }

    #[test]
    fn psql_keeps_going_on_errors() {
        let args = strings(psql_file_args(
            "postgres://postgres@db/metrics",
            Path::new("/backups/metrics_hypertables.sql"),
        ));
        assert!(args.contains(&"ON_ERROR_STOP=0".to_string()));
        assert_eq!(&args[args.len() - 2..], &["-f".to_string(), "/backups/metrics_hypertables.sql".to_string()]);
    }
}
