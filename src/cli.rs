//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "restoretool")]
#[command(author, version, about = "Restore PostgreSQL/TimescaleDB backups into a running server", long_about = None)]
pub struct Cli {
    /// JSON configuration file (defaults to ./restoretool.json when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Restore a backup into a database
    Restore {
        /// Target database name
        database: String,

        /// Backup file, directory-format dump or .tar.gz bundle, relative to the backup mount
        backup: String,

        /// Comma-separated roles to provision and grant (empty or omitted: read <db>.roles)
        roles: Option<String>,

        /// Literal `force` to restore over an already restored database
        force: Option<String>,
    },

    /// Dump a database and its TimescaleDB companion files into the backup mount
    Backup {
        database: String,

        /// Also bundle everything into a timestamped .tar.gz
        #[arg(long)]
        archive: bool,
    },

    /// Wait until the database server accepts connections
    Wait,

    /// Print the post-restore report for a database
    Report {
        database: String,

        /// Number of tables to list
        #[arg(short = 'n', long)]
        limit: Option<i64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_positionals() {
        let cli = Cli::parse_from(["restoretool", "restore", "orders_db", "orders_db.dump", "app_writer,reporting", "force"]);
        match cli.command {
            Commands::Restore { database, backup, roles, force } => {
                assert_eq!(database, "orders_db");
                assert_eq!(backup, "orders_db.dump");
                assert_eq!(roles.as_deref(), Some("app_writer,reporting"));
                assert_eq!(force.as_deref(), Some("force"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn restore_requires_backup() {
        assert!(Cli::try_parse_from(["restoretool", "restore", "orders_db"]).is_err());
    }

    #[test]
    fn global_config_after_subcommand() {
        let cli = Cli::parse_from(["restoretool", "report", "metrics", "--limit", "5", "--config", "/etc/restoretool.json"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/restoretool.json")));
        assert!(matches!(cli.command, Commands::Report { limit: Some(5), .. }));
    }
}
