//! Database pool construction and resilient store access
//!
//! Every write in the auth core goes through [`with_retry`], which retries
//! the transient conflict class of errors (serialization failures,
//! deadlocks, dropped connections) with exponential backoff. Acquiring a
//! fresh connection from the pool on each attempt re-establishes the
//! underlying session, so a half-dead connection never gets reused.
//! Non-transient errors propagate on the first attempt.

use std::future::Future;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

/// Bounded attempt count for transient store errors.
/// Surfaced to callers as ServiceUnavailable once exhausted.
pub const MAX_RETRY_ATTEMPTS: usize = 4;

/// Base delay for the exponential backoff schedule (50ms, 100ms, 200ms, ...)
const RETRY_BASE_DELAY_MS: u64 = 50;

/// Create the application database pool
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!("Database pool created");
    Ok(pool)
}

/// Classify a store error as transient (worth retrying) or not
///
/// Transient: serialization failure (40001), deadlock (40P01), duplicate
/// prepared statement (42P05, seen behind PgBouncer), pool acquisition
/// timeouts, and raw I/O drops. Everything else - constraint violations,
/// decode errors, missing rows - is a real result and propagates
/// immediately.
pub fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some("40001") | Some("40P01") | Some("42P05")
        ),
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        _ => false,
    }
}

/// Execute a persistence operation, retrying transient conflicts
///
/// The operation is a closure so each attempt re-acquires its connection
/// from the pool. Backoff is exponential with jitter. The classifier
/// decides retryability; the final error (transient or not) is returned
/// to the caller unchanged.
pub async fn with_retry<T, F, Fut>(op: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let strategy = ExponentialBackoff::from_millis(RETRY_BASE_DELAY_MS)
        .map(jitter)
        .take(MAX_RETRY_ATTEMPTS - 1);

    RetryIf::spawn(strategy, op, |error: &sqlx::Error| {
        let retry = is_transient(error);
        if retry {
            tracing::warn!(error = ?error, "Transient store error, retrying with backoff");
        }
        retry
    })
    .await
}
