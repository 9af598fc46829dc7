// restoretool/src/backup/companions.rs
//! TimescaleDB companion files written next to a dump.
//!
//! A plain `pg_dump` of a hypertable database restores the chunk data but not
//! reliably the extension's own bookkeeping, so the backup side exports the
//! hypertable layout, continuous aggregates, compression settings and jobs as
//! re-runnable SQL. Every generated statement is idempotent.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Pool, Postgres};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::timescale::{EXTENSION_NAME, SupplementaryStep};
use crate::utils::sql::{quote_ident, quote_literal, quote_qualified};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkInterval {
    Time(String),
    Integer(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hypertable {
    pub schema: String,
    pub name: String,
    pub time_column: String,
    pub chunk_interval: Option<ChunkInterval>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuousAggregate {
    pub schema: String,
    pub name: String,
    pub definition: String,
    pub materialized_only: bool,
}

/// One column of a hypertable's compression settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionColumn {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub segmentby_index: Option<i16>,
    pub orderby_index: Option<i16>,
    pub orderby_asc: Option<bool>,
}

/// A user background job, with continuous aggregate jobs already mapped back
/// to the view they refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub proc_name: String,
    pub schema: String,
    pub relation: String,
    pub config: Value,
    pub schedule_interval: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimescaleMetadata {
    pub database: String,
    pub extension_version: String,
    pub hypertables: Vec<String>,
    pub continuous_aggregates: Vec<String>,
    pub compressed_hypertables: usize,
    pub policies: usize,
    pub exported_at: DateTime<Utc>,
}

/// Everything read from `timescaledb_information` for one database.
#[derive(Debug, Clone)]
pub struct TimescaleExport {
    pub extension_version: String,
    pub hypertables: Vec<Hypertable>,
    pub continuous_aggregates: Vec<ContinuousAggregate>,
    pub compression: Vec<CompressionColumn>,
    pub jobs: Vec<Job>,
}

fn interval_literal(value: &str) -> String {
    format!("INTERVAL {}", quote_literal(value))
}

/// Renders a job config value: strings are intervals, numbers stay integers.
fn config_argument(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(interval_literal(s)),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some("NULL".to_string()),
        _ => None,
    }
}

pub fn hypertable_sql(hypertables: &[Hypertable]) -> Result<String> {
    let mut sql = String::new();
    for ht in hypertables {
        let relation = quote_literal(&quote_qualified(&ht.schema, &ht.name)?);
        let interval = match &ht.chunk_interval {
            Some(ChunkInterval::Time(value)) => {
                format!(", chunk_time_interval => {}", interval_literal(value))
            }
            Some(ChunkInterval::Integer(value)) => format!(", chunk_time_interval => {}", value),
            None => String::new(),
        };
        sql.push_str(&format!(
            "SELECT create_hypertable({}, {}{}, if_not_exists => TRUE, migrate_data => TRUE);\n",
            relation,
            quote_literal(&ht.time_column),
            interval
        ));
    }
    Ok(sql)
}

pub fn continuous_aggregate_sql(aggregates: &[ContinuousAggregate]) -> Result<String> {
    let mut sql = String::new();
    for cagg in aggregates {
        let definition = cagg.definition.trim().trim_end_matches(';').trim_end();
        sql.push_str(&format!(
            "CREATE MATERIALIZED VIEW IF NOT EXISTS {}\nWITH (timescaledb.continuous, timescaledb.materialized_only = {}) AS\n{}\nWITH NO DATA;\n",
            quote_qualified(&cagg.schema, &cagg.name)?,
            cagg.materialized_only,
            definition
        ));
    }
    Ok(sql)
}

/// One `ALTER TABLE ... SET (timescaledb.compress, ...)` per hypertable, in the
/// order the hypertables first appear in `columns`.
pub fn compression_sql(columns: &[CompressionColumn]) -> Result<String> {
    let mut tables: Vec<(&str, &str)> = Vec::new();
    for col in columns {
        if !tables.contains(&(col.schema.as_str(), col.table.as_str())) {
            tables.push((col.schema.as_str(), col.table.as_str()));
        }
    }

    let mut sql = String::new();
    for (schema, table) in tables {
        let of_table = || columns.iter().filter(move |c| c.schema == schema && c.table == table);

        let mut segmentby: Vec<&CompressionColumn> =
            of_table().filter(|c| c.segmentby_index.is_some()).collect();
        segmentby.sort_by_key(|c| c.segmentby_index);
        let mut orderby: Vec<&CompressionColumn> =
            of_table().filter(|c| c.orderby_index.is_some()).collect();
        orderby.sort_by_key(|c| c.orderby_index);

        let mut options = vec!["timescaledb.compress".to_string()];
        if !segmentby.is_empty() {
            let list = segmentby
                .iter()
                .map(|c| quote_ident(&c.column))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            options.push(format!(
                "timescaledb.compress_segmentby = {}",
                quote_literal(&list.join(", "))
            ));
        }
        if !orderby.is_empty() {
            let mut list = Vec::with_capacity(orderby.len());
            for c in &orderby {
                let column = quote_ident(&c.column)?;
                list.push(match c.orderby_asc {
                    Some(false) => format!("{} DESC", column),
                    _ => column,
                });
            }
            options.push(format!(
                "timescaledb.compress_orderby = {}",
                quote_literal(&list.join(", "))
            ));
        }
        sql.push_str(&format!(
            "ALTER TABLE {} SET ({});\n",
            quote_qualified(schema, table)?,
            options.join(", ")
        ));
    }
    Ok(sql)
}

/// The `add_*_policy` call that recreates `job`, or `None` for jobs this tool
/// does not know how to recreate.
pub fn policy_statement(job: &Job) -> Result<Option<String>> {
    let relation = quote_literal(&quote_qualified(&job.schema, &job.relation)?);
    let arg = |key: &str| config_argument(job.config.get(key));

    let statement = match job.proc_name.as_str() {
        "policy_retention" => arg("drop_after").map(|drop_after| {
            format!(
                "SELECT add_retention_policy({}, drop_after => {}, if_not_exists => true);",
                relation, drop_after
            )
        }),
        "policy_compression" => arg("compress_after").map(|compress_after| {
            format!(
                "SELECT add_compression_policy({}, compress_after => {}, if_not_exists => true);",
                relation, compress_after
            )
        }),
        "policy_refresh_continuous_aggregate" => {
            let schedule = job
                .schedule_interval
                .as_deref()
                .map(|s| format!(", schedule_interval => {}", interval_literal(s)))
                .unwrap_or_default();
            Some(format!(
                "SELECT add_continuous_aggregate_policy({}, start_offset => {}, end_offset => {}{}, if_not_exists => true);",
                relation,
                arg("start_offset").unwrap_or_else(|| "NULL".to_string()),
                arg("end_offset").unwrap_or_else(|| "NULL".to_string()),
                schedule
            ))
        }
        _ => None,
    };
    Ok(statement)
}

pub fn policy_sql(jobs: &[Job]) -> Result<String> {
    let mut sql = String::new();
    for job in jobs {
        match policy_statement(job)? {
            Some(statement) => {
                sql.push_str(&statement);
                sql.push('\n');
            }
            None => warn!(
                "⚠️ Skipping job {} on {}.{}: not a recreatable policy",
                job.proc_name, job.schema, job.relation
            ),
        }
    }
    Ok(sql)
}

impl TimescaleExport {
    /// Reads the TimescaleDB layout of the connected database, or `None` when
    /// the extension is not installed.
    pub async fn collect(db_pool: &Pool<Postgres>) -> Result<Option<Self>> {
        let version: Option<String> =
            sqlx::query_scalar("SELECT extversion::text FROM pg_extension WHERE extname = $1")
                .bind(EXTENSION_NAME)
                .fetch_optional(db_pool)
                .await
                .context("Failed to look up the TimescaleDB extension")?;
        let Some(extension_version) = version else {
            return Ok(None);
        };

        let hypertables = sqlx::query_as::<_, (String, String, String, Option<String>, Option<i64>)>(
            "SELECT hypertable_schema::text, hypertable_name::text, column_name::text,
                    time_interval::text, integer_interval
             FROM timescaledb_information.dimensions
             WHERE dimension_number = 1
             ORDER BY hypertable_schema, hypertable_name",
        )
        .fetch_all(db_pool)
        .await
        .context("Failed to read hypertable dimensions")?
        .into_iter()
        .map(|(schema, name, time_column, time_interval, integer_interval)| Hypertable {
            schema,
            name,
            time_column,
            chunk_interval: time_interval
                .map(ChunkInterval::Time)
                .or(integer_interval.map(ChunkInterval::Integer)),
        })
        .collect();

        let continuous_aggregates = sqlx::query_as::<_, (String, String, String, bool)>(
            "SELECT view_schema::text, view_name::text, view_definition::text, materialized_only
             FROM timescaledb_information.continuous_aggregates
             ORDER BY view_schema, view_name",
        )
        .fetch_all(db_pool)
        .await
        .context("Failed to read continuous aggregates")?
        .into_iter()
        .map(|(schema, name, definition, materialized_only)| ContinuousAggregate {
            schema,
            name,
            definition,
            materialized_only,
        })
        .collect();

        let compression = sqlx::query_as::<_, (String, String, String, Option<i16>, Option<i16>, Option<bool>)>(
            "SELECT hypertable_schema::text, hypertable_name::text, attname::text,
                    segmentby_column_index, orderby_column_index, orderby_asc
             FROM timescaledb_information.compression_settings
             ORDER BY hypertable_schema, hypertable_name, attname",
        )
        .fetch_all(db_pool)
        .await
        .context("Failed to read compression settings")?
        .into_iter()
        .map(|(schema, table, column, segmentby_index, orderby_index, orderby_asc)| CompressionColumn {
            schema,
            table,
            column,
            segmentby_index,
            orderby_index,
            orderby_asc,
        })
        .collect();

        let job_rows = sqlx::query_as::<_, (String, Option<String>, Option<String>, Option<String>, Option<String>)>(
            "SELECT j.proc_name::text,
                    COALESCE(ca.view_schema, j.hypertable_schema)::text,
                    COALESCE(ca.view_name, j.hypertable_name)::text,
                    j.config::text,
                    j.schedule_interval::text
             FROM timescaledb_information.jobs j
             LEFT JOIN timescaledb_information.continuous_aggregates ca
               ON ca.materialization_hypertable_schema = j.hypertable_schema
              AND ca.materialization_hypertable_name = j.hypertable_name
             WHERE j.job_id >= 1000
             ORDER BY j.job_id",
        )
        .fetch_all(db_pool)
        .await
        .context("Failed to read background jobs")?;

        let mut jobs = Vec::new();
        for (proc_name, schema, relation, config, schedule_interval) in job_rows {
            let (Some(schema), Some(relation)) = (schema, relation) else {
                warn!("⚠️ Skipping job {} without a target relation", proc_name);
                continue;
            };
            let config = match config {
                Some(text) => serde_json::from_str(&text)
                    .with_context(|| format!("Invalid config for job {}", proc_name))?,
                None => Value::Null,
            };
            jobs.push(Job {
                proc_name,
                schema,
                relation,
                config,
                schedule_interval,
            });
        }

        Ok(Some(TimescaleExport {
            extension_version,
            hypertables,
            continuous_aggregates,
            compression,
            jobs,
        }))
    }

    pub fn metadata(&self, database: &str) -> TimescaleMetadata {
        let mut compressed: Vec<(&str, &str)> = self
            .compression
            .iter()
            .map(|c| (c.schema.as_str(), c.table.as_str()))
            .collect();
        compressed.dedup();
        TimescaleMetadata {
            database: database.to_string(),
            extension_version: self.extension_version.clone(),
            hypertables: self
                .hypertables
                .iter()
                .map(|h| format!("{}.{}", h.schema, h.name))
                .collect(),
            continuous_aggregates: self
                .continuous_aggregates
                .iter()
                .map(|c| format!("{}.{}", c.schema, c.name))
                .collect(),
            compressed_hypertables: compressed.len(),
            policies: self.jobs.len(),
            exported_at: Utc::now(),
        }
    }

    /// SQL for one supplementary step; empty when there is nothing to recreate.
    pub fn step_sql(&self, step: SupplementaryStep) -> Result<String> {
        match step {
            SupplementaryStep::Hypertables => hypertable_sql(&self.hypertables),
            SupplementaryStep::ContinuousAggregates => {
                continuous_aggregate_sql(&self.continuous_aggregates)
            }
            SupplementaryStep::Compression => compression_sql(&self.compression),
            SupplementaryStep::Policies => policy_sql(&self.jobs),
        }
    }

    /// Writes the metadata file and every non-empty step script into `dir`.
    pub fn write_files(&self, dir: &Path, database: &str) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();

        let metadata_path = dir.join(format!("{}_timescale_metadata.json", database));
        let metadata = serde_json::to_string_pretty(&self.metadata(database))
            .context("Failed to serialise TimescaleDB metadata")?;
        fs::write(&metadata_path, metadata)
            .with_context(|| format!("Failed to write {}", metadata_path.display()))?;
        written.push(metadata_path);

        for step in SupplementaryStep::ORDERED {
            let sql = self.step_sql(step)?;
            if sql.is_empty() {
                info!("No {} to export", step);
                continue;
            }
            let path = dir.join(step.file_name(database));
            fs::write(&path, sql).with_context(|| format!("Failed to write {}", path.display()))?;
            info!("✓ Exported {} to {}", step, path.display());
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conditions() -> Hypertable {
        Hypertable {
            schema: "public".to_string(),
            name: "conditions".to_string(),
            time_column: "time".to_string(),
            chunk_interval: Some(ChunkInterval::Time("7 days".to_string())),
        }
    }

    fn job(proc_name: &str, relation: &str, config: Value) -> Job {
        Job {
            proc_name: proc_name.to_string(),
            schema: "public".to_string(),
            relation: relation.to_string(),
            config,
            schedule_interval: Some("01:00:00".to_string()),
        }
    }

    #[test]
    fn hypertables_are_recreated_idempotently() -> anyhow::Result<()> {
        let mut by_id = conditions();
        by_id.name = "events".to_string();
        by_id.time_column = "seq".to_string();
        by_id.chunk_interval = Some(ChunkInterval::Integer(100000));

        let sql = hypertable_sql(&[conditions(), by_id])?;
        assert_eq!(
            sql,
            "SELECT create_hypertable('\"public\".\"conditions\"', 'time', chunk_time_interval => INTERVAL '7 days', if_not_exists => TRUE, migrate_data => TRUE);\n\
             SELECT create_hypertable('\"public\".\"events\"', 'seq', chunk_time_interval => 100000, if_not_exists => TRUE, migrate_data => TRUE);\n"
        );
        Ok(())
    }

    #[test]
    fn continuous_aggregate_definition_is_wrapped() -> anyhow::Result<()> {
        let sql = continuous_aggregate_sql(&[ContinuousAggregate {
            schema: "public".to_string(),
            name: "conditions_hourly".to_string(),
            definition: " SELECT time_bucket('01:00:00'::interval, time) AS bucket, avg(temp) FROM conditions GROUP BY 1;".to_string(),
            materialized_only: true,
        }])?;
        assert!(sql.starts_with(
            "CREATE MATERIALIZED VIEW IF NOT EXISTS \"public\".\"conditions_hourly\"\nWITH (timescaledb.continuous, timescaledb.materialized_only = true) AS\nSELECT time_bucket"
        ));
        assert!(sql.ends_with("GROUP BY 1\nWITH NO DATA;\n"));
        Ok(())
    }

    #[test]
    fn compression_settings_grouped_per_table() -> anyhow::Result<()> {
        let column = |column: &str, seg: Option<i16>, ord: Option<i16>, asc: Option<bool>| CompressionColumn {
            schema: "public".to_string(),
            table: "conditions".to_string(),
            column: column.to_string(),
            segmentby_index: seg,
            orderby_index: ord,
            orderby_asc: asc,
        };
        let sql = compression_sql(&[
            column("time", None, Some(1), Some(false)),
            column("location", Some(1), None, None),
            column("deviceId", Some(2), None, None),
            column("user", Some(3), None, None),
        ])?;
        assert_eq!(
            sql,
            "ALTER TABLE \"public\".\"conditions\" SET (timescaledb.compress, timescaledb.compress_segmentby = '\"location\", \"deviceId\", \"user\"', timescaledb.compress_orderby = '\"time\" DESC');\n"
        );
        assert!(compression_sql(&[])?.is_empty());
        Ok(())
    }

    #[test]
    fn policies_from_job_configs() -> anyhow::Result<()> {
        let retention = job("policy_retention", "conditions", json!({"drop_after": "30 days", "hypertable_id": 1}));
        assert_eq!(
            policy_statement(&retention)?.as_deref(),
            Some("SELECT add_retention_policy('\"public\".\"conditions\"', drop_after => INTERVAL '30 days', if_not_exists => true);")
        );

        let compression = job("policy_compression", "events", json!({"compress_after": 5000, "hypertable_id": 2}));
        assert_eq!(
            policy_statement(&compression)?.as_deref(),
            Some("SELECT add_compression_policy('\"public\".\"events\"', compress_after => 5000, if_not_exists => true);")
        );

        let refresh = job(
            "policy_refresh_continuous_aggregate",
            "conditions_hourly",
            json!({"start_offset": "1 mon", "end_offset": "01:00:00", "mat_hypertable_id": 3}),
        );
        assert_eq!(
            policy_statement(&refresh)?.as_deref(),
            Some("SELECT add_continuous_aggregate_policy('\"public\".\"conditions_hourly\"', start_offset => INTERVAL '1 mon', end_offset => INTERVAL '01:00:00', schedule_interval => INTERVAL '01:00:00', if_not_exists => true);")
        );
        Ok(())
    }

    #[test]
    fn unknown_jobs_are_left_out() -> anyhow::Result<()> {
        let custom = job("my_custom_job", "conditions", json!({}));
        assert_eq!(policy_statement(&custom)?, None);
        let missing_arg = job("policy_retention", "conditions", json!({}));
        assert_eq!(policy_statement(&missing_arg)?, None);
        assert!(policy_sql(&[custom])?.is_empty());
        Ok(())
    }

    #[test]
    fn writes_metadata_and_non_empty_scripts() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let export = TimescaleExport {
            extension_version: "2.14.2".to_string(),
            hypertables: vec![conditions()],
            continuous_aggregates: Vec::new(),
            compression: Vec::new(),
            jobs: vec![job("policy_retention", "conditions", json!({"drop_after": "30 days"}))],
        };
        let written = export.write_files(dir.path(), "metrics")?;
        let names: Vec<String> = written
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        assert_eq!(
            names,
            vec![
                "metrics_timescale_metadata.json",
                "metrics_hypertables.sql",
                "metrics_policies.sql",
            ]
        );

        let metadata: TimescaleMetadata =
            serde_json::from_str(&fs::read_to_string(&written[0])?)?;
        assert_eq!(metadata.hypertables, vec!["public.conditions"]);
        assert_eq!(metadata.policies, 1);
        assert_eq!(metadata.compressed_hypertables, 0);
        Ok(())
    }
}
