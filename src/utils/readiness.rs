// restoretool/src/utils/readiness.rs
use sqlx::{Connection, PgConnection};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::errors::{AppError, Result};
use crate::utils::connection::redact_url;

/// How long and how often to poll the server before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessBudget {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ReadinessBudget {
    fn default() -> Self {
        ReadinessBudget {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Calls `probe` every `budget.interval` until it reports ready.
///
/// Returns the number of attempts made, or `AppError::NeverReady` once the
/// budget is spent. At least one probe always runs, even with a zero timeout.
/// A single probe may take the rest of the budget (at least one interval)
/// and counts as not ready when it runs over.
pub async fn poll_until_ready<F, Fut>(budget: ReadinessBudget, mut probe: F) -> Result<u32>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let limit = budget
            .timeout
            .saturating_sub(started.elapsed())
            .max(budget.interval);
        match tokio::time::timeout(limit, probe()).await {
            Ok(true) => return Ok(attempts),
            Ok(false) => {}
            Err(_) => debug!("Readiness probe gave no answer within {:?}", limit),
        }
        let waited = started.elapsed();
        if waited + budget.interval > budget.timeout {
            return Err(AppError::NeverReady { attempts, waited });
        }
        tokio::time::sleep(budget.interval).await;
    }
}

/// Blocks until the server behind `db_url` accepts connections and answers `SELECT 1`.
pub async fn wait_for_server(db_url: &str, budget: ReadinessBudget) -> Result<()> {
    info!("⏳ Waiting for database server at {}", redact_url(db_url));
    let attempts = poll_until_ready(budget, || async {
        match PgConnection::connect(db_url).await {
            Ok(mut conn) => {
                let ok = sqlx::query("SELECT 1").execute(&mut conn).await.is_ok();
                let _ = conn.close().await;
                ok
            }
            Err(e) => {
                debug!("Server not ready yet: {}", e);
                false
            }
        }
    })
    .await?;
    info!("✓ Database server ready after {} attempt(s)", attempts);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(interval_ms: u64, timeout_ms: u64) -> ReadinessBudget {
        ReadinessBudget {
            interval: Duration::from_millis(interval_ms),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn returns_on_first_success() {
        let attempts = poll_until_ready(budget(5, 100), || async { true }).await;
        assert_eq!(attempts.ok(), Some(1));
    }

    #[tokio::test]
    async fn retries_until_ready() {
        let mut calls = 0;
        let attempts = poll_until_ready(budget(1, 5_000), || {
            calls += 1;
            let ready = calls >= 3;
            async move { ready }
        })
        .await;
        assert_eq!(attempts.ok(), Some(3));
    }

    #[tokio::test]
    async fn gives_up_with_never_ready() {
        let result = poll_until_ready(budget(5, 20), || async { false }).await;
        match result {
            Err(AppError::NeverReady { attempts, .. }) => assert!(attempts >= 1),
            other => panic!("expected NeverReady, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn hanging_probe_cannot_outlast_the_budget() {
        let started = Instant::now();
        let result = poll_until_ready(budget(5, 30), || std::future::pending::<bool>()).await;
        assert!(matches!(result, Err(AppError::NeverReady { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn zero_timeout_still_probes_once() {
        let mut calls = 0;
        let result = poll_until_ready(budget(10, 0), || {
            calls += 1;
            async { false }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
