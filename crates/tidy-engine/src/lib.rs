//! Database cleanup & integrity repair engine.
//!
//! A run deduplicates catalogued tables (rewiring dependents first), repairs
//! missing relationships, standardizes names, installs uniqueness constraints
//! and runs read-only integrity checks, in that order, against a live Postgres
//! schema. Dry-run mode performs every detection query and mutates nothing.

pub mod catalog;
pub mod config;
pub mod constraints;
pub mod dedup;
pub mod detect;
pub mod error;
pub mod exclusive;
pub mod integrity;
pub mod orchestrator;
pub mod repair;
pub mod rewrite;
pub mod scheduler;
pub mod sql;
pub mod standardize;

use sqlx::PgPool;
use tidy_core::CleanupReport;

pub use catalog::{CatalogError, SchemaCatalog};
pub use config::CleanupConfig;
pub use error::RunError;
pub use exclusive::run_exclusive;
pub use orchestrator::{
    AssumeYes, CancelFlag, CleanupOrchestrator, Confirm, Decline, RunOptions, RunState,
};
pub use scheduler::{maybe_build_scheduler, ScheduledCleanup};

pub const CRATE_NAME: &str = "tidy-engine";

/// Runs every phase once against `pool`.
///
/// `Err` means the run could not proceed (unreachable database, invalid
/// catalog, cancellation) and no report exists. Per-table and per-task
/// failures are recorded on the returned report instead.
pub async fn run_cleanup(
    pool: &PgPool,
    catalog: &SchemaCatalog,
    options: RunOptions,
    confirm: &dyn Confirm,
    cancel: &CancelFlag,
) -> Result<CleanupReport, RunError> {
    CleanupOrchestrator::new(pool, catalog, options)
        .run(confirm, cancel)
        .await
}
