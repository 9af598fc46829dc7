pub mod connection;
pub mod readiness;
pub mod sql;

use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use which::which;

use crate::errors::AppError;

/// PostgreSQL client binaries this tool drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgTool {
    PgDump,
    PgRestore,
    Psql,
}

impl PgTool {
    pub fn executable(self) -> &'static str {
        match self {
            PgTool::PgDump => "pg_dump",
            PgTool::PgRestore => "pg_restore",
            PgTool::Psql => "psql",
        }
    }

    /// Finds the executable in the system PATH.
    pub fn locate(self) -> Result<PathBuf> {
        which(self.executable())
            .map_err(|_| AppError::ToolNotFound(self.executable()))
            .with_context(|| format!("Looking up {}", self.executable()))
    }
}

/// Captured result of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl From<Output> for ToolOutput {
    fn from(output: Output) -> Self {
        ToolOutput {
            success: output.status.success(),
            status: output.status.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

impl ToolOutput {
    /// Turns a failed invocation into an `AppError::Command`.
    pub fn into_error(self, tool: PgTool) -> AppError {
        AppError::Command {
            program: tool.executable().to_string(),
            status: self.status,
            stderr: self.stderr,
        }
    }
}

/// Runs a PostgreSQL client tool to completion and captures its output.
///
/// `passfile` is forwarded as `PGPASSFILE` so the tools pick up the same
/// credentials file as the rest of the run.
pub fn run_pg_tool<I, S>(tool: PgTool, args: I, passfile: Option<&Path>) -> Result<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program = tool.locate()?;
    let mut command = Command::new(&program);
    command.args(args);
    if let Some(passfile) = passfile {
        command.env("PGPASSFILE", passfile);
    }
    let output = command
        .output()
        .with_context(|| format!("Failed to execute {}", program.display()))?;
    Ok(ToolOutput::from(output))
}
