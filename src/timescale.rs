// restoretool/src/timescale.rs
//! TimescaleDB names shared by the backup and restore sides.

use std::fmt;

pub const EXTENSION_NAME: &str = "timescaledb";

/// Extension-owned schemas that receive scoped grants after a restore.
pub const CATALOG_SCHEMA: &str = "_timescaledb_catalog";
pub const CONFIG_SCHEMA: &str = "_timescaledb_config";
pub const INTERNAL_SCHEMA: &str = "_timescaledb_internal";

/// Schemas never treated as user schemas when granting privileges or listing tables.
pub fn is_extension_schema(schema: &str) -> bool {
    schema.starts_with("_timescaledb_")
        || schema.starts_with("timescaledb_")
        || schema == "toolkit_experimental"
}

/// Post-restore steps that rebuild TimescaleDB metadata, in the order they must run.
///
/// Continuous aggregates select from hypertables, compression settings apply to
/// hypertables, and policies reference both, so the order is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupplementaryStep {
    Hypertables,
    ContinuousAggregates,
    Compression,
    Policies,
}

impl SupplementaryStep {
    pub const ORDERED: [SupplementaryStep; 4] = [
        SupplementaryStep::Hypertables,
        SupplementaryStep::ContinuousAggregates,
        SupplementaryStep::Compression,
        SupplementaryStep::Policies,
    ];

    /// Suffix of the companion SQL file, `<db>_<suffix>.sql`.
    pub fn file_suffix(self) -> &'static str {
        match self {
            SupplementaryStep::Hypertables => "hypertables",
            SupplementaryStep::ContinuousAggregates => "continuous_aggregates",
            SupplementaryStep::Compression => "compression",
            SupplementaryStep::Policies => "policies",
        }
    }

    pub fn file_name(self, database: &str) -> String {
        format!("{}_{}.sql", database, self.file_suffix())
    }

    /// Catalog query whose non-zero count proves the step took effect.
    pub fn verification_query(self) -> &'static str {
        match self {
            SupplementaryStep::Hypertables => {
                "SELECT count(*)::bigint FROM timescaledb_information.hypertables"
            }
            SupplementaryStep::ContinuousAggregates => {
                "SELECT count(*)::bigint FROM timescaledb_information.continuous_aggregates"
            }
            SupplementaryStep::Compression => {
                "SELECT count(DISTINCT (hypertable_schema, hypertable_name))::bigint FROM timescaledb_information.compression_settings"
            }
            // Job ids below 1000 belong to the extension's own background jobs.
            SupplementaryStep::Policies => {
                "SELECT count(*)::bigint FROM timescaledb_information.jobs WHERE job_id >= 1000"
            }
        }
    }
}

impl fmt::Display for SupplementaryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SupplementaryStep::Hypertables => "hypertables",
            SupplementaryStep::ContinuousAggregates => "continuous aggregates",
            SupplementaryStep::Compression => "compression settings",
            SupplementaryStep::Policies => "policies",
        };
        f.write_str(label)
    }
}
