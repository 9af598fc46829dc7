use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("{0} executable not found in PATH. Please ensure PostgreSQL client tools are installed and in your PATH.")]
    ToolNotFound(&'static str),

    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Database server never became ready after {attempts} attempts ({waited:?})")]
    NeverReady { attempts: u32, waited: Duration },

    #[error("Another restore of '{database}' is in progress (lock file {})", lock_path.display())]
    RestoreInProgress { database: String, lock_path: PathBuf },

    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
