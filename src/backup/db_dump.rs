// restoretool/src/backup/db_dump.rs
use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::is_system_database;
use crate::utils::connection::{database_url, redact_url};
use crate::utils::{PgTool, run_pg_tool};

pub fn pg_dump_args(db_url: &str, dump_file_path: &Path) -> Vec<OsString> {
    vec![
        OsString::from("--format=custom"),
        OsString::from("--no-password"),
        OsString::from("--file"),
        dump_file_path.as_os_str().to_os_string(),
        OsString::from(db_url),
    ]
}

/// Dumps `db_name` in custom format to `<target_dump_dir>/<db_name>.dump`.
pub fn dump_database(
    admin_db_url: &str,
    db_name: &str,
    target_dump_dir: &Path,
    passfile: Option<&Path>,
) -> Result<PathBuf> {
    if db_name.trim().is_empty() || db_name.starts_with("template") {
        anyhow::bail!("Refusing to back up '{}'", db_name);
    }
    if is_system_database(db_name) {
        anyhow::bail!("Refusing to back up system database '{}'", db_name);
    }

    fs::create_dir_all(target_dump_dir).with_context(|| {
        format!("Failed to create backup directory: {}", target_dump_dir.display())
    })?;
    let db_url = database_url(admin_db_url, db_name)?;
    let dump_file_path = target_dump_dir.join(format!("{}.dump", db_name));

    info!(
        "Dumping {} to {} using pg_dump...",
        redact_url(&db_url),
        dump_file_path.display()
    );
    let output = run_pg_tool(PgTool::PgDump, pg_dump_args(&db_url, &dump_file_path), passfile)
        .with_context(|| format!("Failed to execute pg_dump for database: {}", db_name))?;
    if !output.success {
        return Err(output.into_error(PgTool::PgDump))
            .with_context(|| format!("pg_dump for database {} failed", db_name));
    }
    info!("✓ {} dumped successfully via pg_dump.", db_name);
    Ok(dump_file_path)
}
