//! Read-only integrity checks. Findings are reported, never repaired.

use sqlx::PgPool;
use tidy_core::{
    CleanupReport, IntegrityCheck, IntegrityCheckKind, IntegrityIssue, IntegrityRow, Phase,
    INTEGRITY_SAMPLE_LIMIT, SOFT_DELETE_COLUMN,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{triage, RunError};
use crate::orchestrator::RunContext;
use crate::sql::quote_ident;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSql {
    /// `FROM ... WHERE ...` selecting violating rows as alias `r`.
    pub violations: String,
    /// Text expression describing a violating row.
    pub detail: String,
    /// Whether `violations` takes the entity type as `$1`.
    pub binds_entity_type: bool,
}

pub fn check_sql(kind: &IntegrityCheckKind) -> CheckSql {
    let deleted_at = quote_ident(SOFT_DELETE_COLUMN);
    match kind {
        IntegrityCheckKind::OrphanedReference {
            table,
            column,
            parent_table,
        } => {
            let column = quote_ident(column);
            CheckSql {
                violations: format!(
                    "FROM {} r WHERE r.{deleted_at} IS NULL AND r.{column} IS NOT NULL \
                     AND NOT EXISTS (SELECT 1 FROM {} p \
                     WHERE p.id = r.{column} AND p.{deleted_at} IS NULL)",
                    quote_ident(table),
                    quote_ident(parent_table)
                ),
                detail: format!("r.{column}::text"),
                binds_entity_type: false,
            }
        }
        IntegrityCheckKind::PolymorphicOrphan {
            table,
            type_column,
            id_column,
            parent_table,
            ..
        } => {
            let id_column = quote_ident(id_column);
            CheckSql {
                violations: format!(
                    "FROM {} r WHERE r.{deleted_at} IS NULL AND r.{} = $1 \
                     AND NOT EXISTS (SELECT 1 FROM {} p \
                     WHERE p.id = r.{id_column} AND p.{deleted_at} IS NULL)",
                    quote_ident(table),
                    quote_ident(type_column),
                    quote_ident(parent_table)
                ),
                detail: format!("r.{id_column}::text"),
                binds_entity_type: true,
            }
        }
        IntegrityCheckKind::InvalidDateRange {
            table,
            start_column,
            end_column,
        } => {
            let start = quote_ident(start_column);
            let end = quote_ident(end_column);
            CheckSql {
                violations: format!(
                    "FROM {} r WHERE r.{deleted_at} IS NULL AND r.{start} > r.{end}",
                    quote_ident(table)
                ),
                detail: format!("r.{start}::text || ' > ' || r.{end}::text"),
                binds_entity_type: false,
            }
        }
    }
}

/// Counts and samples one check inside a read-only transaction.
pub async fn run_check(
    pool: &PgPool,
    check: &IntegrityCheck,
) -> Result<IntegrityIssue, sqlx::Error> {
    let sql = check_sql(&check.kind);
    let entity_type = match &check.kind {
        IntegrityCheckKind::PolymorphicOrphan { entity_type, .. } => Some(entity_type.as_str()),
        _ => None,
    };

    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION READ ONLY")
        .execute(&mut *tx)
        .await?;

    let count_sql = format!("SELECT COUNT(*) {}", sql.violations);
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
    if let Some(entity_type) = entity_type {
        count_query = count_query.bind(entity_type);
    }
    let count = count_query.fetch_one(&mut *tx).await?;

    let sample_sql = format!(
        "SELECT r.id, {} AS detail {} ORDER BY r.id LIMIT {INTEGRITY_SAMPLE_LIMIT}",
        sql.detail, sql.violations
    );
    let mut sample_query = sqlx::query_as::<_, (Uuid, Option<String>)>(&sample_sql);
    if let Some(entity_type) = entity_type {
        sample_query = sample_query.bind(entity_type);
    }
    let sample = sample_query.fetch_all(&mut *tx).await?;
    tx.rollback().await?;

    Ok(IntegrityIssue {
        count: count.max(0) as u64,
        sample: sample
            .into_iter()
            .map(|(id, detail)| IntegrityRow { id, detail })
            .collect(),
    })
}

pub(crate) async fn run_phase(
    ctx: &mut RunContext<'_>,
    report: &mut CleanupReport,
) -> Result<(), RunError> {
    let catalog = ctx.catalog;
    for check in &catalog.integrity_checks {
        ctx.checkpoint(Phase::Integrity)?;

        match run_check(ctx.pool, check).await {
            Ok(issue) => {
                if issue.count > 0 {
                    info!(check = %check.name, count = issue.count, "integrity violations found");
                }
                report.integrity_issues.insert(check.name.clone(), issue);
            }
            Err(err) => {
                let err = triage(err)?;
                warn!(check = %check.name, error = %err, "integrity check failed");
                report.record_issue(
                    Phase::Integrity,
                    Some(check.kind.table()),
                    format!("{}: {err}", check.name),
                );
            }
        }
    }
    Ok(())
}
