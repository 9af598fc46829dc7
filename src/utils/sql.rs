// restoretool/src/utils/sql.rs
//! Quoting helpers for SQL that has to be assembled as text.
//!
//! Utility statements (`CREATE ROLE`, `GRANT`, `ALTER SCHEMA ... OWNER`) cannot
//! take bind parameters for identifiers, so every name that reaches such a
//! statement goes through [`quote_ident`] and every string value through
//! [`quote_literal`].

use crate::errors::{AppError, Result};

/// Quotes an identifier the way PostgreSQL's `quote_ident` does, always
/// wrapping it in double quotes.
pub fn quote_ident(name: &str) -> Result<String> {
    if name.is_empty() || name.contains('\0') {
        return Err(AppError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quotes a string literal, switching to the `E''` form when backslashes are present.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    if escaped.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{}'", escaped)
    }
}

/// Quotes a possibly schema-qualified name as `"schema"."name"`.
pub fn quote_qualified(schema: &str, name: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_ident(schema)?, quote_ident(name)?))
}
