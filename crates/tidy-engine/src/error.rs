use thiserror::Error;
use tidy_core::Phase;

use crate::catalog::CatalogError;

/// Failures that abort a run. Everything else is recorded on the report.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("database unreachable: {0}")]
    Connectivity(#[source] sqlx::Error),
    #[error("invalid schema catalog: {0}")]
    InvalidCatalog(#[from] CatalogError),
    #[error("run cancelled before the {phase} phase")]
    Cancelled { phase: Phase },
}

/// Errors after which no further statement can succeed.
pub fn is_fatal(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

/// Splits an error into a run-aborting one (`Err`) or a recordable one (`Ok`).
pub fn triage(err: sqlx::Error) -> Result<sqlx::Error, RunError> {
    if is_fatal(&err) {
        Err(RunError::Connectivity(err))
    } else {
        Ok(err)
    }
}

pub(crate) fn sqlstate(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.into_owned())
}
