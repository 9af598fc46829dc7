// restoretool/src/restore/diagnostics.rs
//! Sorting tool output into expected noise and lines worth a second look.
//!
//! This is a hint for the operator only. Whether a step worked is decided by
//! re-querying the catalog, never by these patterns.

use regex::RegexSet;
use std::sync::OnceLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Benign,
    Suspicious,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub line: String,
}

fn benign_patterns() -> &'static RegexSet {
    static PATTERNS: OnceLock<RegexSet> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        RegexSet::new([
            r#"extension "timescaledb" (already exists|has already been loaded)"#,
            r"(?i)already exists",
            r"duplicate key value violates unique constraint .*(hypertable|dimension|chunk|bgw_job|continuous_agg|metadata)",
            r"_timescaledb_(catalog|config|internal|cache)",
            r"^\s*(psql:[^ ]+:\d+: )?NOTICE:",
            r"(?i)hypertable .* (created|already a hypertable|migrating data)",
            r"TimescaleDB background worker",
            r"^pg_restore: warning: errors ignored on restore: \d+",
            r"^\s*(HINT|DETAIL|CONTEXT):",
            r"^pg_restore: (from TOC entry|while PROCESSING TOC)",
        ])
        .expect("benign output patterns are valid regexes")
    })
}

fn is_noteworthy(line: &str) -> bool {
    line.contains("ERROR")
        || line.contains("WARNING")
        || line.contains("FATAL")
        || line.contains("error:")
        || line.contains("warning:")
}

/// Classifies the noteworthy lines of a tool's stderr.
///
/// Plain progress output is dropped; NOTICE lines are kept as benign.
pub fn classify_output(stderr: &str) -> Vec<Diagnostic> {
    let patterns = benign_patterns();
    stderr
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .filter(|line| is_noteworthy(line) || line.contains("NOTICE:"))
        .map(|line| Diagnostic {
            severity: if patterns.is_match(line) {
                Severity::Benign
            } else {
                Severity::Suspicious
            },
            line: line.to_string(),
        })
        .collect()
}

/// Logs a summary of `stderr` and returns the number of suspicious lines.
pub fn log_diagnostics(context: &str, stderr: &str) -> usize {
    let diagnostics = classify_output(stderr);
    let benign = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Benign)
        .count();
    let suspicious: Vec<&Diagnostic> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Suspicious)
        .collect();

    if benign > 0 {
        debug!("{}: {} expected message(s) in tool output", context, benign);
    }
    for diagnostic in &suspicious {
        warn!("{}: {}", context, diagnostic.line);
    }
    suspicious.len()
}
