//! Relationship repair: each task is a closed-form (detect, fix) SQL pair.

use sqlx::PgPool;
use tidy_core::{
    CleanupReport, Phase, RepairSample, RepairStrategy, RepairTask, NAME_COLUMN,
    REPAIR_SAMPLE_LIMIT, SOFT_DELETE_COLUMN,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::SchemaCatalog;
use crate::error::{triage, RunError};
use crate::orchestrator::RunContext;
use crate::sql::quote_ident;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairSql {
    /// `FROM ... WHERE ...` selecting the defective rows as alias `r`.
    pub defects: String,
    /// Single statement fixing every defect, `RETURNING r.id`.
    pub fix: String,
    /// Whether `fix` takes the default value as `$1`.
    pub binds_value: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairOutcome {
    pub count: u64,
    pub sample: Vec<RepairSample>,
}

pub fn repair_sql(catalog: &SchemaCatalog, task: &RepairTask) -> RepairSql {
    let table = quote_ident(&task.table);
    let deleted_at = quote_ident(SOFT_DELETE_COLUMN);

    match &task.strategy {
        RepairStrategy::AssignFirstCandidate {
            column,
            candidate_table,
            candidate_match_column,
            row_match_column,
        } => {
            let column = quote_ident(column);
            let candidates = format!(
                "FROM {} c WHERE c.{} = r.{} AND c.{deleted_at} IS NULL",
                quote_ident(candidate_table),
                quote_ident(candidate_match_column),
                quote_ident(row_match_column),
            );
            let predicate = format!(
                "r.{deleted_at} IS NULL AND r.{column} IS NULL AND EXISTS (SELECT 1 {candidates})"
            );
            let priority = quote_ident(catalog.priority_column_of(candidate_table));
            RepairSql {
                defects: format!("FROM {table} r WHERE {predicate}"),
                fix: format!(
                    "UPDATE {table} r SET {column} = (SELECT c.id {candidates} \
                     ORDER BY c.{priority} ASC NULLS LAST, c.id ASC LIMIT 1) \
                     WHERE {predicate} RETURNING r.id"
                ),
                binds_value: false,
            }
        }
        RepairStrategy::SetDefault { column, .. } => {
            let column = quote_ident(column);
            let predicate = format!("r.{deleted_at} IS NULL AND r.{column} IS NULL");
            RepairSql {
                defects: format!("FROM {table} r WHERE {predicate}"),
                fix: format!("UPDATE {table} r SET {column} = $1 WHERE {predicate} RETURNING r.id"),
                binds_value: true,
            }
        }
        RepairStrategy::InheritFromParent {
            column,
            parent_fk,
            parent_table,
            parent_column,
        } => {
            let column = quote_ident(column);
            let parent = quote_ident(parent_table);
            let parent_column = quote_ident(parent_column);
            let predicate = format!(
                "p.id = r.{} AND r.{deleted_at} IS NULL AND p.{deleted_at} IS NULL \
                 AND r.{column} IS DISTINCT FROM p.{parent_column}",
                quote_ident(parent_fk)
            );
            RepairSql {
                defects: format!("FROM {table} r JOIN {parent} p ON {predicate}"),
                fix: format!(
                    "UPDATE {table} r SET {column} = p.{parent_column} FROM {parent} p \
                     WHERE {predicate} RETURNING r.id"
                ),
                binds_value: false,
            }
        }
    }
}

/// Detects and, unless `dry_run`, fixes one defect class.
/// `AssignFirstCandidate` is a placeholder policy: it picks the earliest live
/// candidate and has no business-rule basis beyond that ordering.
pub async fn repair(
    pool: &PgPool,
    catalog: &SchemaCatalog,
    task: &RepairTask,
    dry_run: bool,
) -> Result<RepairOutcome, sqlx::Error> {
    let sql = repair_sql(catalog, task);

    if dry_run {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) {}", sql.defects))
            .fetch_one(pool)
            .await?;
        let sample: Vec<(Uuid, Option<String>)> = sqlx::query_as(&format!(
            "SELECT r.id, to_jsonb(r) ->> '{NAME_COLUMN}' AS label {} \
             ORDER BY r.id LIMIT {REPAIR_SAMPLE_LIMIT}",
            sql.defects
        ))
        .fetch_all(pool)
        .await?;
        return Ok(RepairOutcome {
            count: count.max(0) as u64,
            sample: sample
                .into_iter()
                .map(|(id, label)| RepairSample { id, label })
                .collect(),
        });
    }

    let query = sqlx::query_scalar::<_, Uuid>(&sql.fix);
    let query = match &task.strategy {
        RepairStrategy::SetDefault { value, .. } if sql.binds_value => query.bind(value.as_str()),
        _ => query,
    };
    let fixed = query.fetch_all(pool).await?;
    Ok(RepairOutcome {
        count: fixed.len() as u64,
        sample: Vec::new(),
    })
}

pub(crate) async fn run_phase(
    ctx: &mut RunContext<'_>,
    report: &mut CleanupReport,
) -> Result<(), RunError> {
    let catalog = ctx.catalog;
    for task in &catalog.repairs {
        ctx.checkpoint(Phase::Relationships)?;
        if ctx.skipped_tables.contains(&task.table) {
            warn!(task = %task.name, table = %task.table, "repair skipped after detection failure");
            continue;
        }

        match repair(ctx.pool, catalog, task, ctx.dry_run).await {
            Ok(outcome) => {
                info!(
                    task = %task.name,
                    count = outcome.count,
                    dry_run = ctx.dry_run,
                    "repair task done"
                );
                report
                    .relationships_repaired
                    .insert(task.name.clone(), outcome.count);
                if !outcome.sample.is_empty() {
                    report.repair_samples.insert(task.name.clone(), outcome.sample);
                }
            }
            Err(err) => {
                let err = triage(err)?;
                warn!(task = %task.name, error = %err, "repair task failed");
                report.record_issue(
                    Phase::Relationships,
                    Some(&task.table),
                    format!("{}: {err}", task.name),
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str) -> RepairTask {
        SchemaCatalog::builtin()
            .repairs
            .into_iter()
            .find(|t| t.name == name)
            .unwrap()
    }

    #[test]
    fn missing_division_picks_earliest_candidate_in_same_league() {
        let catalog = SchemaCatalog::builtin();
        let sql = repair_sql(&catalog, &task("teams_missing_division"));
        assert!(sql.defects.starts_with("FROM \"teams\" r WHERE"));
        assert!(sql.defects.contains("r.\"division_conference_id\" IS NULL"));
        assert!(sql.defects.contains("c.\"league_id\" = r.\"league_id\""));
        assert!(sql.fix.contains("ORDER BY c.\"created_at\" ASC NULLS LAST, c.id ASC LIMIT 1"));
        assert!(sql.fix.ends_with("RETURNING r.id"));
        assert!(!sql.binds_value);
    }

    #[test]
    fn set_default_binds_the_value() {
        let catalog = SchemaCatalog::builtin();
        let sql = repair_sql(&catalog, &task("broadcast_rights_missing_territory"));
        assert_eq!(
            sql.fix,
            "UPDATE \"broadcast_rights\" r SET \"territory\" = $1 \
             WHERE r.\"deleted_at\" IS NULL AND r.\"territory\" IS NULL RETURNING r.id"
        );
        assert!(sql.binds_value);
    }

    #[test]
    fn inherit_from_parent_only_touches_disagreeing_rows() {
        let catalog = SchemaCatalog::builtin();
        let sql = repair_sql(&catalog, &task("teams_league_mismatch"));
        assert!(sql
            .defects
            .contains("JOIN \"division_conferences\" p ON p.id = r.\"division_conference_id\""));
        assert!(sql
            .fix
            .contains("r.\"league_id\" IS DISTINCT FROM p.\"league_id\""));
        assert!(sql.fix.starts_with("UPDATE \"teams\" r SET \"league_id\" = p.\"league_id\""));
    }
}
