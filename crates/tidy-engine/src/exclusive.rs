//! Serializes runs across processes with a session-level advisory lock.

use sqlx::PgPool;
use tidy_core::CleanupReport;
use tracing::{info, warn};

use crate::catalog::SchemaCatalog;
use crate::error::RunError;
use crate::orchestrator::{CancelFlag, Confirm, RunOptions};
use crate::run_cleanup;

/// Runs the engine while holding `pg_try_advisory_lock(lock_key)`.
/// Returns `Ok(None)` without running when another session holds the lock.
pub async fn run_exclusive(
    pool: &PgPool,
    catalog: &SchemaCatalog,
    options: RunOptions,
    confirm: &dyn Confirm,
    cancel: &CancelFlag,
    lock_key: i64,
) -> Result<Option<CleanupReport>, RunError> {
    let mut conn = pool.acquire().await.map_err(RunError::Connectivity)?;
    let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
        .bind(lock_key)
        .fetch_one(&mut *conn)
        .await
        .map_err(RunError::Connectivity)?;
    if !locked {
        info!(lock_key, "another cleanup run holds the lock");
        return Ok(None);
    }

    let result = run_cleanup(pool, catalog, options, confirm, cancel).await;

    if let Err(err) = sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(lock_key)
        .execute(&mut *conn)
        .await
    {
        // closing the session releases the lock
        warn!(lock_key, error = %err, "advisory unlock failed; dropping connection");
        drop(conn.detach());
    }
    result.map(Some)
}
