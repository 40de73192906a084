//! Name standardization with a collision guard.
//!
//! Rules for a table run in declaration order and each sees the effect of the
//! ones before it. A rewrite that would produce a name already held by another
//! row of the table is skipped, never forced.

use std::collections::HashMap;

use regex::Regex;
use sqlx::PgPool;
use tidy_core::{CleanupReport, Phase, StandardizationRule, NAME_COLUMN, SOFT_DELETE_COLUMN};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{is_fatal, triage, RunError};
use crate::orchestrator::RunContext;
use crate::sql::quote_ident;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct NameRow {
    pub id: Uuid,
    pub name: Option<String>,
    pub live: bool,
}

#[derive(Debug, Default)]
pub struct StandardizeOutcome {
    pub fixed: u64,
    pub collisions: u64,
    /// Rules that failed without aborting the table, as `(pattern, message)`.
    pub failed_rules: Vec<(String, String)>,
}

/// The rewritten name, or `None` when the rule leaves `name` as it is.
fn rewrite(regex: &Regex, replacement: &str, name: &str) -> Option<String> {
    if !regex.is_match(name) {
        return None;
    }
    let renamed = regex.replace_all(name, replacement);
    if renamed == name || renamed.is_empty() {
        return None;
    }
    Some(renamed.into_owned())
}

fn compile(
    rules: &[&StandardizationRule],
    outcome: &mut StandardizeOutcome,
) -> Vec<(Regex, String)> {
    rules
        .iter()
        .filter_map(|rule| match Regex::new(&rule.pattern) {
            Ok(regex) => Some((regex, rule.replacement.clone())),
            Err(err) => {
                outcome
                    .failed_rules
                    .push((rule.pattern.clone(), err.to_string()));
                None
            }
        })
        .collect()
}

/// Runs `rules` over an in-memory copy of a table's names, applying the same
/// ordering and collision guard as the database path.
pub fn simulate(rows: &mut [NameRow], rules: &[(Regex, String)]) -> StandardizeOutcome {
    let mut taken: HashMap<String, usize> = HashMap::new();
    for name in rows.iter().filter_map(|row| row.name.as_ref()) {
        *taken.entry(name.clone()).or_default() += 1;
    }

    let mut outcome = StandardizeOutcome::default();
    for (regex, replacement) in rules {
        for row in rows.iter_mut().filter(|row| row.live) {
            let Some(current) = row.name.as_deref() else {
                continue;
            };
            let Some(renamed) = rewrite(regex, replacement, current) else {
                continue;
            };
            if taken.get(&renamed).copied().unwrap_or(0) > 0 {
                outcome.collisions += 1;
                continue;
            }
            if let Some(count) = taken.get_mut(current) {
                *count = count.saturating_sub(1);
            }
            *taken.entry(renamed.clone()).or_default() += 1;
            row.name = Some(renamed);
            outcome.fixed += 1;
        }
    }
    outcome
}

pub async fn standardize(
    pool: &PgPool,
    table: &str,
    rules: &[&StandardizationRule],
    dry_run: bool,
) -> Result<StandardizeOutcome, sqlx::Error> {
    let mut outcome = StandardizeOutcome::default();
    let compiled = compile(rules, &mut outcome);
    let quoted = quote_ident(table);
    let name = quote_ident(NAME_COLUMN);
    let deleted_at = quote_ident(SOFT_DELETE_COLUMN);

    if dry_run {
        let mut rows: Vec<NameRow> = sqlx::query_as(&format!(
            "SELECT id, {name}::text AS name, {deleted_at} IS NULL AS live \
             FROM {quoted} ORDER BY id"
        ))
        .fetch_all(pool)
        .await?;
        let simulated = simulate(&mut rows, &compiled);
        outcome.fixed = simulated.fixed;
        outcome.collisions = simulated.collisions;
        return Ok(outcome);
    }

    // rows are matched in Rust so both modes share one regex dialect
    let select = format!(
        "SELECT id, {name}::text AS name FROM {quoted} WHERE {deleted_at} IS NULL ORDER BY id"
    );
    let probe =
        format!("SELECT EXISTS (SELECT 1 FROM {quoted} WHERE {name} = $1 AND id <> $2)");
    let update = format!("UPDATE {quoted} SET {name} = $1 WHERE id = $2");

    for (regex, replacement) in &compiled {
        let result = async {
            let rows: Vec<(Uuid, Option<String>)> =
                sqlx::query_as(&select).fetch_all(pool).await?;
            for (id, current) in rows {
                let Some(renamed) = current
                    .as_deref()
                    .and_then(|current| rewrite(regex, replacement, current))
                else {
                    continue;
                };
                let collides: bool = sqlx::query_scalar(&probe)
                    .bind(&renamed)
                    .bind(id)
                    .fetch_one(pool)
                    .await?;
                if collides {
                    debug!(
                        table,
                        %id,
                        renamed = %renamed,
                        "standardization skipped on collision"
                    );
                    outcome.collisions += 1;
                    continue;
                }
                sqlx::query(&update)
                    .bind(&renamed)
                    .bind(id)
                    .execute(pool)
                    .await?;
                outcome.fixed += 1;
            }
            Ok::<(), sqlx::Error>(())
        }
        .await;

        match result {
            Ok(()) => {}
            Err(err) if is_fatal(&err) => return Err(err),
            Err(err) => outcome
                .failed_rules
                .push((regex.as_str().to_string(), err.to_string())),
        }
    }
    Ok(outcome)
}

pub(crate) async fn run_phase(
    ctx: &mut RunContext<'_>,
    report: &mut CleanupReport,
) -> Result<(), RunError> {
    let catalog = ctx.catalog;
    for table in catalog.standardized_tables() {
        ctx.checkpoint(Phase::Standardization)?;
        if ctx.skipped_tables.contains(table) {
            warn!(table, "standardization skipped after detection failure");
            continue;
        }

        let rules = catalog.rules_for(table);
        match standardize(ctx.pool, table, &rules, ctx.dry_run).await {
            Ok(outcome) => {
                for (pattern, message) in &outcome.failed_rules {
                    warn!(
                        table,
                        pattern = %pattern,
                        error = %message,
                        "standardization rule failed"
                    );
                    report.record_issue(
                        Phase::Standardization,
                        Some(table),
                        format!("rule `{pattern}` failed: {message}"),
                    );
                }
                info!(
                    table,
                    fixed = outcome.fixed,
                    collisions = outcome.collisions,
                    "names standardized"
                );
                report
                    .names_standardized
                    .insert(table.to_string(), outcome.fixed);
            }
            Err(err) => {
                let err = triage(err)?;
                warn!(table, error = %err, "standardization failed");
                report.record_issue(Phase::Standardization, Some(table), err.to_string());
            }
        }
    }
    Ok(())
}
