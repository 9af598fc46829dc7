// restoretool/src/restore/roles.rs
use anyhow::{Context, Result};
use sqlx::{Pool, Postgres};
use tracing::info;

use crate::utils::sql::{quote_ident, quote_literal};

/// Session defaults applied to every role this tool creates.
pub const SESSION_DEFAULTS: &[(&str, &str)] = &[
    ("client_encoding", "UTF8"),
    ("default_transaction_isolation", "read committed"),
    ("timezone", "UTC"),
];

/// Statements that create `role` with login and the fixed session defaults.
pub fn create_role_statements(role: &str, password: &str) -> Result<Vec<String>> {
    let ident = quote_ident(role)?;
    let mut statements = vec![format!(
        "CREATE ROLE {} WITH LOGIN PASSWORD {}",
        ident,
        quote_literal(password)
    )];
    for (setting, value) in SESSION_DEFAULTS {
        statements.push(format!(
            "ALTER ROLE {} SET {} TO {}",
            ident,
            setting,
            quote_literal(value)
        ));
    }
    Ok(statements)
}

pub fn grant_connect_statement(database: &str, role: &str) -> Result<String> {
    Ok(format!(
        "GRANT CONNECT ON DATABASE {} TO {}",
        quote_ident(database)?,
        quote_ident(role)?
    ))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProvisionSummary {
    pub created: Vec<String>,
    pub existing: Vec<String>,
}

/// Makes sure every role in `roles` exists, creating missing ones.
///
/// Fails fast: the first SQL error aborts the run. A password is only needed
/// when a role actually has to be created.
pub async fn provision_roles(
    admin_pool: &Pool<Postgres>,
    roles: &[String],
    default_password: Option<&str>,
) -> Result<ProvisionSummary> {
    let mut summary = ProvisionSummary::default();
    for role in roles {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_roles WHERE rolname = $1)")
                .bind(role)
                .fetch_one(admin_pool)
                .await
                .with_context(|| format!("Failed to check existence of role '{}'", role))?;

        if exists {
            info!("Role '{}' already exists", role);
            summary.existing.push(role.clone());
            continue;
        }

        let password = default_password.with_context(|| {
            format!(
                "Role '{}' must be created but DEFAULT_ROLE_PASSWORD is not set",
                role
            )
        })?;
        for statement in create_role_statements(role, password)? {
            sqlx::query(&statement)
                .execute(admin_pool)
                .await
                .with_context(|| format!("Failed to create role '{}'", role))?;
        }
        info!("✓ Role '{}' created", role);
        summary.created.push(role.clone());
    }
    Ok(summary)
}

/// Grants CONNECT on `database` to every role. Re-granting is a no-op.
pub async fn grant_connect(
    admin_pool: &Pool<Postgres>,
    database: &str,
    roles: &[String],
) -> Result<()> {
    for role in roles {
        sqlx::query(&grant_connect_statement(database, role)?)
            .execute(admin_pool)
            .await
            .with_context(|| {
                format!("Failed to grant CONNECT on '{}' to '{}'", database, role)
            })?;
    }
    if !roles.is_empty() {
        info!("✓ CONNECT on '{}' granted to {:?}", database, roles);
    }
    Ok(())
}
