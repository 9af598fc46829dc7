// restoretool/src/utils/connection.rs
use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use url::Url;

/// Builds the URL of `db_name` on the same server as `admin_url`.
pub fn database_url(admin_url: &str, db_name: &str) -> Result<String> {
    let mut parsed = Url::parse(admin_url)
        .with_context(|| format!("Invalid database URL format: {}", redact_url(admin_url)))?;
    parsed
        .path_segments_mut()
        .map_err(|_| anyhow::anyhow!("Database URL cannot carry a path: {}", redact_url(admin_url)))?
        .clear()
        .push(db_name);
    Ok(parsed.to_string())
}

/// Extracts the database name from a PostgreSQL connection URL.
pub fn get_db_name_from_url(db_url: &str) -> Result<String> {
    let parsed_url = Url::parse(db_url)
        .with_context(|| format!("Invalid database URL format: {}", redact_url(db_url)))?;
    let path = parsed_url.path().trim_start_matches('/');
    if path.is_empty() {
        Err(anyhow::anyhow!("Database name not found in URL path: {}", redact_url(db_url)))
    } else {
        Ok(path.to_string())
    }
}

/// Replaces the password of a connection URL so it can be logged.
pub fn redact_url(db_url: &str) -> String {
    match Url::parse(db_url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}

/// Opens a small pool against `db_url`.
pub async fn connect(db_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(2)
        .connect(db_url)
        .await
        .with_context(|| format!("Failed to connect to {}", redact_url(db_url)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swaps_database_path() -> anyhow::Result<()> {
        let url = database_url("postgres://postgres:pw@db:5432/postgres", "orders_db")?;
        assert_eq!(url, "postgres://postgres:pw@db:5432/orders_db");
        assert_eq!(get_db_name_from_url(&url)?, "orders_db");
        Ok(())
    }

    #[test]
    fn keeps_query_parameters() -> anyhow::Result<()> {
        let url = database_url("postgres://postgres@db/postgres?sslmode=disable", "metrics")?;
        assert_eq!(url, "postgres://postgres@db/metrics?sslmode=disable");
        Ok(())
    }

    #[test]
    fn encodes_odd_database_names() -> anyhow::Result<()> {
        let url = database_url("postgres://postgres@db/postgres", "my db")?;
        assert_eq!(url, "postgres://postgres@db/my%20db");
        Ok(())
    }

    #[test]
    fn missing_database_name_is_an_error() {
        assert!(get_db_name_from_url("postgres://postgres@db").is_err());
    }

    #[test]
    fn redacts_password() {
        assert_eq!(
            redact_url("postgres://postgres:hunter2@db:5432/postgres"),
            "postgres://postgres:***@db:5432/postgres"
        );
        assert_eq!(redact_url("postgres://postgres@db/postgres"), "postgres://postgres@db/postgres");
    }
}
