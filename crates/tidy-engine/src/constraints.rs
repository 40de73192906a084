//! Idempotent constraint installation.

use sqlx::PgPool;
use tidy_core::{CleanupReport, ConstraintOutcome, ConstraintSpec, Phase};
use tracing::{info, warn};

use crate::error::{sqlstate, triage, RunError};
use crate::orchestrator::RunContext;
use crate::sql::quote_ident;

const DUPLICATE_OBJECT: &str = "42710";
const DUPLICATE_TABLE: &str = "42P07";

const CONSTRAINT_EXISTS_SQL: &str = "\
SELECT EXISTS (
  SELECT 1
  FROM pg_constraint con
  JOIN pg_class rel ON rel.oid = con.conrelid
  JOIN pg_namespace nsp ON nsp.oid = rel.relnamespace
  WHERE nsp.nspname = current_schema()
    AND rel.relname = $1
    AND con.conname = $2
)";

pub async fn constraint_exists(pool: &PgPool, spec: &ConstraintSpec) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar(CONSTRAINT_EXISTS_SQL)
        .bind(&spec.table)
        .bind(&spec.name)
        .fetch_one(pool)
        .await
}

pub fn add_constraint_sql(spec: &ConstraintSpec) -> String {
    format!(
        "ALTER TABLE {} ADD CONSTRAINT {} {}",
        quote_ident(&spec.table),
        quote_ident(&spec.name),
        spec.definition
    )
}

/// Adds `spec` unless it is already present. The `ALTER TABLE` runs in its own
/// transaction, so a failure rolls back only that statement.
pub async fn ensure(
    pool: &PgPool,
    spec: &ConstraintSpec,
    dry_run: bool,
) -> Result<ConstraintOutcome, sqlx::Error> {
    if constraint_exists(pool, spec).await? {
        return Ok(ConstraintOutcome::Skipped);
    }
    if dry_run {
        return Ok(ConstraintOutcome::WouldAdd);
    }

    let mut tx = pool.begin().await?;
    match sqlx::query(&add_constraint_sql(spec)).execute(&mut *tx).await {
        Ok(_) => {
            tx.commit().await?;
            Ok(ConstraintOutcome::Added)
        }
        Err(err) if is_duplicate_object(&err) => {
            tx.rollback().await?;
            Ok(ConstraintOutcome::Skipped)
        }
        Err(err) => {
            tx.rollback().await?;
            Err(err)
        }
    }
}

/// Another session created the constraint (or its backing index) between the
/// existence check and the `ALTER TABLE`.
fn is_duplicate_object(err: &sqlx::Error) -> bool {
    matches!(
        sqlstate(err).as_deref(),
        Some(DUPLICATE_OBJECT) | Some(DUPLICATE_TABLE)
    )
}

pub(crate) async fn run_phase(
    ctx: &mut RunContext<'_>,
    report: &mut CleanupReport,
) -> Result<(), RunError> {
    let catalog = ctx.catalog;
    for spec in &catalog.constraints {
        ctx.checkpoint(Phase::Constraints)?;

        match ensure(ctx.pool, spec, ctx.dry_run).await {
            Ok(outcome) => {
                info!(table = %spec.table, constraint = %spec.name, ?outcome, "constraint ensured");
                report.record_constraint(&spec.name, outcome);
            }
            Err(err) => {
                let err = triage(err)?;
                warn!(
                    table = %spec.table,
                    constraint = %spec.name,
                    error = %err,
                    "constraint not added"
                );
                report.record_issue(
                    Phase::Constraints,
                    Some(&spec.table),
                    format!("{}: {err}", spec.name),
                );
            }
        }
    }
    Ok(())
}
