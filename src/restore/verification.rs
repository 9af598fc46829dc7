// restoretool/src/restore/verification.rs
use anyhow::{Context, Result};
use sqlx::{Pool, Postgres};
use std::fmt;
use tracing::{info, warn};

use crate::timescale::{EXTENSION_NAME, SupplementaryStep};

/// TimescaleDB object counts of a restored database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimescaleCounts {
    pub hypertables: i64,
    pub chunks: i64,
    pub continuous_aggregates: i64,
    pub policies: i64,
}

/// Read-only summary printed after a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub database: String,
    pub tables: Vec<String>,
    pub total_tables: i64,
    pub size: Option<String>,
    pub timescale: Option<TimescaleCounts>,
}

impl fmt::Display for RestoreReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "📋 Report for database '{}'", self.database)?;
        writeln!(f, "  Size: {}", self.size.as_deref().unwrap_or("unknown"))?;
        if self.tables.is_empty() {
            writeln!(f, "  Tables: none")?;
        } else {
            writeln!(f, "  Tables ({} total, showing {}):", self.total_tables, self.tables.len())?;
            for table in &self.tables {
                writeln!(f, "    - {}", table)?;
            }
        }
        if let Some(ts) = &self.timescale {
            writeln!(f, "  TimescaleDB:")?;
            writeln!(f, "    Hypertables:           {}", ts.hypertables)?;
            writeln!(f, "    Chunks:                {}", ts.chunks)?;
            writeln!(f, "    Continuous aggregates: {}", ts.continuous_aggregates)?;
            write!(f, "    Policies:              {}", ts.policies)?;
        }
        Ok(())
    }
}

const TABLES_QUERY: &str = "SELECT table_schema || '.' || table_name FROM information_schema.tables
     WHERE table_type = 'BASE TABLE'
       AND table_schema NOT IN ('pg_catalog', 'information_schema')
       AND table_schema NOT LIKE '\\_timescaledb%'
       AND table_schema NOT LIKE 'timescaledb\\_%'
     ORDER BY table_schema, table_name
     LIMIT $1";

async fn list_tables(db_pool: &Pool<Postgres>, limit: i64) -> Result<Vec<String>> {
    sqlx::query_scalar::<_, String>(TABLES_QUERY)
        .bind(limit)
        .fetch_all(db_pool)
        .await
        .context("Failed to list tables")
}

async fn scalar(db_pool: &Pool<Postgres>, query: &str) -> Result<i64> {
    sqlx::query_scalar::<_, i64>(query)
        .fetch_one(db_pool)
        .await
        .with_context(|| format!("Query failed: {}", query))
}

async fn timescale_counts(db_pool: &Pool<Postgres>) -> Result<Option<TimescaleCounts>> {
    let installed: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_extension WHERE extname = $1)")
            .bind(EXTENSION_NAME)
            .fetch_one(db_pool)
            .await
            .context("Failed to check for the TimescaleDB extension")?;
    if !installed {
        return Ok(None);
    }
    Ok(Some(TimescaleCounts {
        hypertables: scalar(db_pool, SupplementaryStep::Hypertables.verification_query()).await?,
        chunks: scalar(db_pool, "SELECT count(*)::bigint FROM timescaledb_information.chunks").await?,
        continuous_aggregates: scalar(
            db_pool,
            SupplementaryStep::ContinuousAggregates.verification_query(),
        )
        .await?,
        policies: scalar(db_pool, SupplementaryStep::Policies.verification_query()).await?,
    }))
}

/// Collects the post-restore report. Every query is best effort: a failing
/// section is logged and left empty.
pub async fn build_report(
    db_pool: &Pool<Postgres>,
    database: &str,
    table_limit: i64,
    has_hypertables: bool,
) -> RestoreReport {
    info!("Collecting report for '{}'", database);
    let mut report = RestoreReport {
        database: database.to_string(),
        ..Default::default()
    };

    match list_tables(db_pool, table_limit).await {
        Ok(tables) => report.tables = tables,
        Err(e) => warn!("⚠️ {:#}", e),
    }
    match scalar(db_pool, crate::restore::logic::USER_TABLE_COUNT_QUERY).await {
        Ok(total) => report.total_tables = total,
        Err(e) => warn!("⚠️ {:#}", e),
    }
    match sqlx::query_scalar::<_, String>("SELECT pg_size_pretty(pg_database_size(current_database()))")
        .fetch_one(db_pool)
        .await
    {
        Ok(size) => report.size = Some(size),
        Err(e) => warn!("⚠️ Failed to compute database size: {}", e),
    }
    if has_hypertables {
        match timescale_counts(db_pool).await {
            Ok(counts) => report.timescale = counts,
            Err(e) => warn!("⚠️ {:#}", e),
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_report_lists_tables() {
        let report = RestoreReport {
            database: "orders_db".to_string(),
            tables: vec!["public.customers".to_string(), "public.orders".to_string()],
            total_tables: 2,
            size: Some("8192 kB".to_string()),
            timescale: None,
        };
        let text = report.to_string();
        assert!(text.starts_with("📋 Report for database 'orders_db'\n"));
        assert!(text.contains("  Size: 8192 kB\n"));
        assert!(text.contains("  Tables (2 total, showing 2):\n    - public.customers\n    - public.orders\n"));
        assert!(!text.contains("TimescaleDB"));
    }

    #[test]
    fn empty_report_after_missing_backup() {
        let report = RestoreReport {
            database: "orders_db".to_string(),
            ..Default::default()
        };
        let text = report.to_string();
        assert!(text.contains("  Size: unknown\n"));
        assert!(text.contains("  Tables: none\n"));
    }

    #[test]
    fn hypertable_report_shows_counts() {
        let report = RestoreReport {
            database: "metrics".to_string(),
            tables: vec!["public.conditions".to_string()],
            total_tables: 1,
            size: Some("24 MB".to_string()),
            timescale: Some(TimescaleCounts {
                hypertables: 1,
                chunks: 12,
                continuous_aggregates: 2,
                policies: 3,
            }),
        };
        let text = report.to_string();
        assert!(text.contains("    Chunks:                12\n"));
        assert!(text.ends_with("    Policies:              3"));
    }
}
