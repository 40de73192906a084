//! Delete-duplicates phase: detect, rewrite dependents, delete surplus rows.

use sqlx::{PgConnection, PgPool};
use tidy_core::{CleanupReport, DuplicateGroup, Phase, TableSpec, DUPLICATE_SAMPLE_LIMIT};
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::SchemaCatalog;
use crate::detect::find_duplicates;
use crate::error::{is_fatal, triage, RunError};
use crate::orchestrator::RunContext;
use crate::rewrite::{discover_dependents, rewrite_dependents, Dependent};
use crate::sql::quote_ident;

/// Result of applying one table's duplicate groups inside a single transaction.
#[derive(Debug, Default)]
pub struct TableRemoval {
    pub removed: u64,
    pub rewritten: u64,
    pub failed_groups: Vec<(Uuid, sqlx::Error)>,
}

/// Removes every group's surplus rows from `spec.name`, one savepoint per group
/// and one commit for the table. A failed group leaves its rows untouched.
pub async fn remove_duplicates(
    pool: &PgPool,
    catalog: &SchemaCatalog,
    spec: &TableSpec,
    groups: &[DuplicateGroup],
) -> Result<TableRemoval, sqlx::Error> {
    let mut outcome = TableRemoval::default();
    if groups.is_empty() {
        return Ok(outcome);
    }

    let dependents = discover_dependents(pool, catalog, &spec.name).await?;
    let delete_sql = format!("DELETE FROM {} WHERE id = ANY($1)", quote_ident(&spec.name));

    let mut tx = pool.begin().await?;
    for group in groups {
        sqlx::query("SAVEPOINT tidy_group").execute(&mut *tx).await?;
        match apply_group(&mut tx, &dependents, &delete_sql, group).await {
            Ok((rewritten, removed)) => {
                sqlx::query("RELEASE SAVEPOINT tidy_group")
                    .execute(&mut *tx)
                    .await?;
                outcome.rewritten += rewritten;
                outcome.removed += removed;
            }
            Err(err) if is_fatal(&err) => return Err(err),
            Err(err) => {
                sqlx::query("ROLLBACK TO SAVEPOINT tidy_group")
                    .execute(&mut *tx)
                    .await?;
                outcome.failed_groups.push((group.keep_id(), err));
            }
        }
    }
    tx.commit().await?;
    Ok(outcome)
}

async fn apply_group(
    conn: &mut PgConnection,
    dependents: &[Dependent],
    delete_sql: &str,
    group: &DuplicateGroup,
) -> Result<(u64, u64), sqlx::Error> {
    let rewritten =
        rewrite_dependents(&mut *conn, dependents, group.keep_id(), group.delete_ids()).await?;
    let removed = sqlx::query(delete_sql)
        .bind(group.delete_ids())
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok((rewritten, removed))
}

pub(crate) async fn run_phase(
    ctx: &mut RunContext<'_>,
    report: &mut CleanupReport,
) -> Result<(), RunError> {
    let catalog = ctx.catalog;
    for spec in catalog.dedup_order() {
        ctx.checkpoint(Phase::Duplicates)?;

        let groups = match find_duplicates(ctx.pool, spec).await {
            Ok(groups) => groups,
            Err(err) => {
                let err = triage(err)?;
                warn!(table = %spec.name, error = %err, "duplicate detection failed");
                report.record_issue(
                    Phase::Duplicates,
                    Some(&spec.name),
                    format!("detection failed: {err}"),
                );
                ctx.skipped_tables.insert(spec.name.clone());
                continue;
            }
        };

        let found = groups.iter().map(|g| g.delete_ids().len() as u64).sum::<u64>();
        report.duplicates_found.insert(spec.name.clone(), found);
        report
            .duplicate_groups
            .insert(spec.name.clone(), groups.len() as u64);

        if ctx.dry_run {
            if !groups.is_empty() {
                report.duplicate_samples.insert(
                    spec.name.clone(),
                    groups
                        .iter()
                        .take(DUPLICATE_SAMPLE_LIMIT)
                        .map(DuplicateGroup::sample)
                        .collect(),
                );
            }
            info!(table = %spec.name, found, groups = groups.len(), "duplicates detected");
            continue;
        }

        let removed = match remove_duplicates(ctx.pool, catalog, spec, &groups).await {
            Ok(outcome) => {
                for (keep_id, err) in &outcome.failed_groups {
                    warn!(
                        table = %spec.name,
                        %keep_id,
                        error = %err,
                        "duplicate group rolled back"
                    );
                    report.record_issue(
                        Phase::Duplicates,
                        Some(&spec.name),
                        format!("group keeping {keep_id} rolled back: {err}"),
                    );
                }
                info!(
                    table = %spec.name,
                    found,
                    removed = outcome.removed,
                    rewritten = outcome.rewritten,
                    "duplicates removed"
                );
                outcome.removed
            }
            Err(err) => {
                let err = triage(err)?;
                warn!(table = %spec.name, error = %err, "duplicate removal failed");
                report.record_issue(
                    Phase::Duplicates,
                    Some(&spec.name),
                    format!("removal failed: {err}"),
                );
                0
            }
        };
        report.duplicates_removed.insert(spec.name.clone(), removed);
    }
    Ok(())
}
