// restoretool/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::AppError;
use crate::utils::readiness::ReadinessBudget;

pub const DEFAULT_CONFIG_FILE: &str = "restoretool.json";
pub const DEFAULT_ADMIN_DATABASE_URL: &str = "postgres://postgres@localhost:5432/postgres";
pub const DEFAULT_BACKUP_MOUNT_PATH: &str = "/backups";
pub const DEFAULT_DATA_DIRECTORY: &str = "/var/lib/postgresql/data";
pub const DEFAULT_REPORT_TABLE_LIMIT: i64 = 20;
pub const FORCE_TOKEN: &str = "force";

/// What to do when a supplementary TimescaleDB step fails its catalog check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Warn and keep going; the restore is still marked complete.
    #[default]
    Continue,
    /// Stop the run; no marker is written.
    Abort,
}

impl FromStr for FailurePolicy {
    type Err = AppError;

    fn from_str(s: &str) -> std::result::Result<Self, AppError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(FailurePolicy::Continue),
            "abort" => Ok(FailurePolicy::Abort),
            other => Err(AppError::Config(format!(
                "Unknown supplementary failure policy '{}', expected 'continue' or 'abort'",
                other
            ))),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Continue => write!(f, "continue"),
            FailurePolicy::Abort => write!(f, "abort"),
        }
    }
}

// Shape of restoretool.json. Every field is optional; environment variables win.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub admin_database_url: Option<String>,
    pub backup_mount_path: Option<PathBuf>,
    pub data_directory: Option<PathBuf>,
    pub default_role_password: Option<String>,
    pub passfile: Option<PathBuf>,
    pub restore_jobs: Option<u32>,
    pub force_parallel_restore: Option<bool>,
    pub readiness_timeout_secs: Option<u64>,
    pub readiness_interval_ms: Option<u64>,
    pub supplementary_failure_policy: Option<FailurePolicy>,
    pub report_table_limit: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub admin_db_url: String,
    pub backup_mount_path: PathBuf,
    pub data_directory: PathBuf,
    pub default_role_password: Option<String>,
    pub passfile: Option<PathBuf>,
    pub restore_jobs: Option<u32>,
    pub force_parallel_restore: bool,
    pub readiness: ReadinessBudget,
    pub failure_policy: FailurePolicy,
    pub report_table_limit: i64,
}

impl AppConfig {
    /// Loads the JSON layer (if any) and applies the process environment on top.
    ///
    /// An explicitly given `config_path` must exist; the default
    /// `restoretool.json` is optional.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let raw = match config_path {
            Some(path) => Self::load_from_json(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load_from_json(default_path)?
                } else {
                    debug!("No {} found, using environment only", DEFAULT_CONFIG_FILE);
                    RawJsonConfig::default()
                }
            }
        };
        Self::resolve(raw, |key| std::env::var(key).ok())
    }

    pub fn load_from_json(config_path: &Path) -> Result<RawJsonConfig> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw: RawJsonConfig = serde_json::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })?;
        info!("Loaded configuration from {}", config_path.display());
        Ok(raw)
    }

    /// Merges the JSON layer with values from `env`, which stands in for the
    /// process environment.
    pub fn resolve<F>(raw: RawJsonConfig, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let admin_db_url = env("ADMIN_DATABASE_URL")
            .or_else(|| env("DATABASE_URL"))
            .or(raw.admin_database_url)
            .unwrap_or_else(|| DEFAULT_ADMIN_DATABASE_URL.to_string());
        url::Url::parse(&admin_db_url).context("ADMIN_DATABASE_URL is not a valid URL")?;

        let backup_mount_path = env("BACKUP_MOUNT_PATH")
            .map(PathBuf::from)
            .or(raw.backup_mount_path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKUP_MOUNT_PATH));
        let data_directory = env("PGDATA")
            .map(PathBuf::from)
            .or(raw.data_directory)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIRECTORY));

        let default_role_password = env("DEFAULT_ROLE_PASSWORD").or(raw.default_role_password);
        let passfile = env("PGPASSFILE").map(PathBuf::from).or(raw.passfile);

        let restore_jobs = match env("PG_RESTORE_JOBS") {
            Some(v) => Some(
                v.trim()
                    .parse::<u32>()
                    .with_context(|| format!("PG_RESTORE_JOBS must be a positive integer, got '{}'", v))?,
            ),
            None => raw.restore_jobs,
        };
        if restore_jobs == Some(0) {
            anyhow::bail!("PG_RESTORE_JOBS must be at least 1");
        }

        let force_parallel_restore = match env("FORCE_PARALLEL_RESTORE") {
            Some(v) => parse_bool(&v).context("FORCE_PARALLEL_RESTORE")?,
            None => raw.force_parallel_restore.unwrap_or(false),
        };

        let defaults = ReadinessBudget::default();
        let timeout_secs = parse_u64_env(&env, "READINESS_TIMEOUT_SECS")?
            .or(raw.readiness_timeout_secs)
            .unwrap_or(defaults.timeout.as_secs());
        let interval_ms = parse_u64_env(&env, "READINESS_INTERVAL_MS")?
            .or(raw.readiness_interval_ms)
            .unwrap_or(defaults.interval.as_millis() as u64);
        if interval_ms == 0 {
            anyhow::bail!("READINESS_INTERVAL_MS must be greater than zero");
        }

        let failure_policy = match env("SUPPLEMENTARY_FAILURE_POLICY") {
            Some(v) => v.parse()?,
            None => raw.supplementary_failure_policy.unwrap_or_default(),
        };

        let report_table_limit = match env("REPORT_TABLE_LIMIT") {
            Some(v) => v
                .trim()
                .parse::<i64>()
                .with_context(|| format!("REPORT_TABLE_LIMIT must be an integer, got '{}'", v))?,
            None => raw.report_table_limit.unwrap_or(DEFAULT_REPORT_TABLE_LIMIT),
        };

        Ok(AppConfig {
            admin_db_url,
            backup_mount_path,
            data_directory,
            default_role_password,
            passfile,
            restore_jobs,
            force_parallel_restore,
            readiness: ReadinessBudget {
                interval: Duration::from_millis(interval_ms),
                timeout: Duration::from_secs(timeout_secs),
            },
            failure_policy,
            report_table_limit: report_table_limit.max(1),
        })
    }
}

fn parse_u64_env<F>(env: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    env(key)
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .with_context(|| format!("{} must be a non-negative integer, got '{}'", key, v))
        })
        .transpose()
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(AppError::Config(format!("'{}' is not a boolean", other)).into()),
    }
}

/// One invocation of the restore command. Immutable for the duration of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreJob {
    pub database: String,
    pub backup_reference: String,
    /// Roles given on the command line; `None` (also for an empty list) falls
    /// back to the `<db>.roles` companion file.
    pub roles: Option<Vec<String>>,
    pub force: bool,
}

impl RestoreJob {
    /// Validates the positional arguments of `restore`.
    pub fn from_args(
        database: &str,
        backup_reference: &str,
        roles: Option<&str>,
        force_token: Option<&str>,
    ) -> Result<Self> {
        let database = database.trim();
        if database.is_empty() {
            return Err(AppError::Config("Target database name is required".to_string()).into());
        }
        if is_system_database(database) {
            anyhow::bail!(
                "Restoring into '{}' is not allowed, it is a critical system database.",
                database
            );
        }
        let backup_reference = backup_reference.trim();
        if backup_reference.is_empty() {
            return Err(AppError::Config("Backup reference is required".to_string()).into());
        }
        let force = match force_token {
            None => false,
            Some(token) if token.trim() == FORCE_TOKEN => true,
            Some(other) => anyhow::bail!(
                "Unexpected fourth argument '{}', the only accepted value is '{}'",
                other,
                FORCE_TOKEN
            ),
        };

        Ok(RestoreJob {
            database: database.to_string(),
            backup_reference: backup_reference.to_string(),
            roles: roles.map(parse_role_list).filter(|list| !list.is_empty()),
            force,
        })
    }
}

/// Splits a role list on commas and newlines, ignoring blanks and `#` comments.
pub fn parse_role_list(list: &str) -> Vec<String> {
    list.lines()
        .map(|line| line.split('#').next().unwrap_or(""))
        .flat_map(|line| line.split(','))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn is_system_database(name: &str) -> bool {
    ["postgres", "template0", "template1"]
        .iter()
        .any(|system| name.eq_ignore_ascii_case(system))
}
