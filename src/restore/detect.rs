// restoretool/src/restore/detect.rs
//! Backup classification from companion metadata and the dump's table of contents.

use anyhow::Result;
use tracing::{info, warn};

use crate::timescale::{CATALOG_SCHEMA, EXTENSION_NAME, is_extension_schema};

// Object types that span more than one word in `pg_restore --list` output.
// Longer entries first so "MATERIALIZED VIEW DATA" wins over "MATERIALIZED VIEW".
const MULTI_WORD_DESCS: &[&str] = &[
    "PUBLICATION TABLES IN SCHEMA",
    "TEXT SEARCH CONFIGURATION",
    "TEXT SEARCH DICTIONARY",
    "TEXT SEARCH TEMPLATE",
    "TEXT SEARCH PARSER",
    "MATERIALIZED VIEW DATA",
    "FOREIGN DATA WRAPPER",
    "DATABASE PROPERTIES",
    "SEQUENCE OWNED BY",
    "PUBLICATION TABLE",
    "MATERIALIZED VIEW",
    "CHECK CONSTRAINT",
    "OPERATOR FAMILY",
    "OPERATOR CLASS",
    "FOREIGN SERVER",
    "FOREIGN TABLE",
    "EVENT TRIGGER",
    "FK CONSTRAINT",
    "ACCESS METHOD",
    "LARGE OBJECT",
    "ROW SECURITY",
    "SEQUENCE SET",
    "USER MAPPING",
    "DEFAULT ACL",
    "TABLE DATA",
    "SHELL TYPE",
];

/// One numbered entry of a `pg_restore --list` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    pub dump_id: u32,
    pub desc: String,
    pub schema: Option<String>,
    /// Object name followed by the owner, as printed by pg_restore.
    pub tag: String,
}

impl TocEntry {
    /// Parses `<id>; <tableoid> <oid> <DESC> <schema> <name> <owner>`.
    ///
    /// Comment lines (starting with `;`) and anything malformed yield `None`.
    pub fn parse(line: &str) -> Option<TocEntry> {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            return None;
        }
        let (id, rest) = line.split_once(';')?;
        let dump_id = id.trim().parse().ok()?;

        let mut tokens = rest.split_whitespace();
        let _table_oid: u32 = tokens.next()?.parse().ok()?;
        let _oid: u32 = tokens.next()?.parse().ok()?;
        let remaining: Vec<&str> = tokens.collect();
        let joined = remaining.join(" ");

        let desc = MULTI_WORD_DESCS
            .iter()
            .find(|d| joined == **d || joined.starts_with(&format!("{} ", d)))
            .map(|d| d.to_string())
            .or_else(|| remaining.first().map(|d| d.to_string()))?;
        let desc_words = desc.split(' ').count();

        let mut after_desc = remaining.into_iter().skip(desc_words);
        let schema = match after_desc.next() {
            Some("-") | None => None,
            Some(schema) => Some(schema.to_string()),
        };
        let tag = after_desc.collect::<Vec<_>>().join(" ");

        Some(TocEntry {
            dump_id,
            desc,
            schema,
            tag,
        })
    }

    pub fn name(&self) -> &str {
        self.tag.split_whitespace().next().unwrap_or("")
    }

    fn is_timescale_extension(&self) -> bool {
        self.desc == "EXTENSION" && self.name() == EXTENSION_NAME
    }

    fn is_hypertable_catalog(&self) -> bool {
        (self.desc == "TABLE" || self.desc == "TABLE DATA")
            && self.schema.as_deref() == Some(CATALOG_SCHEMA)
            && self.name() == "hypertable"
    }

    fn is_user_table(&self) -> bool {
        self.desc == "TABLE"
            && self
                .schema
                .as_deref()
                .is_some_and(|schema| !is_extension_schema(schema))
    }
}

/// Parsed table of contents of a dump.
#[derive(Debug, Clone, Default)]
pub struct TableOfContents {
    pub entries: Vec<TocEntry>,
}

impl TableOfContents {
    pub fn parse(listing: &str) -> Self {
        TableOfContents {
            entries: listing.lines().filter_map(TocEntry::parse).collect(),
        }
    }

    pub fn has_timescale_extension(&self) -> bool {
        self.entries.iter().any(TocEntry::is_timescale_extension)
    }

    pub fn has_hypertable_catalog(&self) -> bool {
        self.entries.iter().any(TocEntry::is_hypertable_catalog)
    }

    /// Number of user tables (outside the extension's schemas) the dump creates.
    pub fn user_table_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_user_table()).count()
    }
}

/// Why a backup got its classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationReason {
    MetadataFile,
    ExtensionEntry,
    HypertableCatalogEntry,
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupClass {
    pub has_hypertables: bool,
    pub reason: ClassificationReason,
}

impl BackupClass {
    fn from_reason(reason: ClassificationReason) -> Self {
        BackupClass {
            has_hypertables: reason != ClassificationReason::Plain,
            reason,
        }
    }
}

/// Classifies a backup as plain or hypertable-bearing.
///
/// Checks run in priority order and the first hit wins: a non-empty metadata
/// file, then a `timescaledb` EXTENSION entry, then the hypertable catalog table.
/// `toc` is only consulted when the metadata check misses. A TOC that cannot be
/// read counts as plain.
pub fn classify<F>(has_metadata_file: bool, toc: F) -> BackupClass
where
    F: FnOnce() -> Result<TableOfContents>,
{
    if has_metadata_file {
        info!("🔎 Companion metadata file present, treating backup as hypertable-bearing");
        return BackupClass::from_reason(ClassificationReason::MetadataFile);
    }

    let toc = match toc() {
        Ok(toc) => toc,
        Err(e) => {
            warn!("⚠️ Could not read table of contents, assuming plain backup: {:#}", e);
            return BackupClass::from_reason(ClassificationReason::Plain);
        }
    };

    let reason = if toc.has_timescale_extension() {
        ClassificationReason::ExtensionEntry
    } else if toc.has_hypertable_catalog() {
        ClassificationReason::HypertableCatalogEntry
    } else {
        ClassificationReason::Plain
    };
    info!("🔎 Backup classified as {:?}", reason);
    BackupClass::from_reason(reason)
}
