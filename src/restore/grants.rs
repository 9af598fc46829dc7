// restoretool/src/restore/grants.rs
use anyhow::{Context, Result};
use sqlx::{Pool, Postgres};
use tracing::{info, warn};

use crate::timescale::{CATALOG_SCHEMA, CONFIG_SCHEMA, INTERNAL_SCHEMA, is_extension_schema};
use crate::utils::sql::quote_ident;

/// Privileges for `role` on one user schema.
///
/// Ownership of the schema is only transferred when `owner` is set, so that
/// with several roles the first one keeps it.
pub fn schema_grant_statements(schema: &str, role: &str, owner: bool) -> Result<Vec<String>> {
    let s = quote_ident(schema)?;
    let r = quote_ident(role)?;
    let mut statements = Vec::new();
    if owner {
        statements.push(format!("ALTER SCHEMA {} OWNER TO {}", s, r));
    }
    statements.extend([
        format!("GRANT USAGE, CREATE ON SCHEMA {} TO {}", s, r),
        format!("GRANT ALL PRIVILEGES ON ALL TABLES IN SCHEMA {} TO {}", s, r),
        format!("GRANT ALL PRIVILEGES ON ALL SEQUENCES IN SCHEMA {} TO {}", s, r),
        format!("GRANT ALL PRIVILEGES ON ALL FUNCTIONS IN SCHEMA {} TO {}", s, r),
        format!("ALTER DEFAULT PRIVILEGES FOR ROLE {r} IN SCHEMA {s} GRANT ALL ON TABLES TO {r}"),
        format!("ALTER DEFAULT PRIVILEGES FOR ROLE {r} IN SCHEMA {s} GRANT ALL ON SEQUENCES TO {r}"),
        format!("ALTER DEFAULT PRIVILEGES FOR ROLE {r} IN SCHEMA {s} GRANT ALL ON FUNCTIONS TO {r}"),
    ]);
    Ok(statements)
}

/// Scoped privileges on the TimescaleDB internal schemas that exist in the database.
///
/// Catalog and config are read-only; the chunk storage schema gets full CRUD.
pub fn timescale_grant_statements(role: &str, existing_schemas: &[String]) -> Result<Vec<String>> {
    let r = quote_ident(role)?;
    let mut statements = Vec::new();
    for schema in [CATALOG_SCHEMA, CONFIG_SCHEMA, INTERNAL_SCHEMA] {
        if !existing_schemas.iter().any(|s| s == schema) {
            continue;
        }
        let s = quote_ident(schema)?;
        statements.push(format!("GRANT USAGE ON SCHEMA {} TO {}", s, r));
        if schema == INTERNAL_SCHEMA {
            statements.push(format!(
                "GRANT SELECT, INSERT, UPDATE, DELETE ON ALL TABLES IN SCHEMA {} TO {}",
                s, r
            ));
        } else {
            statements.push(format!("GRANT SELECT ON ALL TABLES IN SCHEMA {} TO {}", s, r));
        }
    }
    Ok(statements)
}

/// Non-system schemas of the connected database, including the extension's own.
pub async fn list_schemas(db_pool: &Pool<Postgres>) -> Result<Vec<String>> {
    sqlx::query_scalar::<_, String>(
        "SELECT nspname::text FROM pg_catalog.pg_namespace
         WHERE nspname NOT LIKE 'pg\\_%' AND nspname <> 'information_schema'
         ORDER BY nspname",
    )
    .fetch_all(db_pool)
    .await
    .context("Failed to list schemas")
}

/// Applies ownership and grants for every (schema, role) pair of the restored database.
pub async fn apply_grants(
    db_pool: &Pool<Postgres>,
    roles: &[String],
    has_hypertables: bool,
) -> Result<usize> {
    if roles.is_empty() {
        info!("No roles given, skipping privilege grants");
        return Ok(0);
    }

    let schemas = list_schemas(db_pool).await?;
    let user_schemas: Vec<&String> = schemas.iter().filter(|s| !is_extension_schema(s)).collect();

    let mut statements = Vec::new();
    for schema in &user_schemas {
        for (index, role) in roles.iter().enumerate() {
            statements.extend(schema_grant_statements(schema, role, index == 0)?);
        }
    }
    if has_hypertables {
        for role in roles {
            let scoped = timescale_grant_statements(role, &schemas)?;
            if scoped.is_empty() {
                warn!("⚠️ No TimescaleDB internal schemas found for grants");
            }
            statements.extend(scoped);
        }
    }

    for statement in &statements {
        sqlx::query(statement)
            .execute(db_pool)
            .await
            .with_context(|| format!("Failed to apply grant: {}", statement))?;
    }
    info!(
        "✓ Applied {} grant statement(s) on {} schema(s) for {:?}",
        statements.len(),
        user_schemas.len(),
        roles
    );
    Ok(statements.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_gets_schema_ownership() -> anyhow::Result<()> {
        let statements = schema_grant_statements("public", "app_writer", true)?;
        assert_eq!(statements[0], "ALTER SCHEMA \"public\" OWNER TO \"app_writer\"");
        assert_eq!(statements.len(), 8);
        assert!(statements.contains(
            &"ALTER DEFAULT PRIVILEGES FOR ROLE \"app_writer\" IN SCHEMA \"public\" GRANT ALL ON TABLES TO \"app_writer\""
                .to_string()
        ));
        Ok(())
    }

    #[test]
    fn secondary_roles_do_not_take_ownership() -> anyhow::Result<()> {
        let statements = schema_grant_statements("public", "reporting", false)?;
        assert_eq!(statements.len(), 7);
        assert!(statements.iter().all(|s| !s.contains("OWNER TO")));
        assert_eq!(statements[0], "GRANT USAGE, CREATE ON SCHEMA \"public\" TO \"reporting\"");
        Ok(())
    }

    #[test]
    fn timescale_grants_follow_existing_schemas() -> anyhow::Result<()> {
        let schemas = vec![
            "_timescaledb_catalog".to_string(),
            "_timescaledb_internal".to_string(),
            "public".to_string(),
        ];
        let statements = timescale_grant_statements("app_writer", &schemas)?;
        assert_eq!(
            statements,
            vec![
                "GRANT USAGE ON SCHEMA \"_timescaledb_catalog\" TO \"app_writer\"",
                "GRANT SELECT ON ALL TABLES IN SCHEMA \"_timescaledb_catalog\" TO \"app_writer\"",
                "GRANT USAGE ON SCHEMA \"_timescaledb_internal\" TO \"app_writer\"",
                "GRANT SELECT, INSERT, UPDATE, DELETE ON ALL TABLES IN SCHEMA \"_timescaledb_internal\" TO \"app_writer\"",
            ]
        );
        assert!(timescale_grant_statements("app_writer", &[])?.is_empty());
        Ok(())
    }
}
