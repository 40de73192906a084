//! Duplicate detection: one read-only grouping query per table.

use sqlx::{PgPool, Row};
use tidy_core::{DuplicateGroup, TableSpec, SOFT_DELETE_COLUMN};
use uuid::Uuid;

use crate::sql::quote_ident;

/// Builds the grouping query for `spec`. Key expressions are passed through
/// verbatim and cast to text so every key decodes the same way.
pub fn grouping_sql(spec: &TableSpec) -> String {
    let table = quote_ident(&spec.name);
    let priority = quote_ident(&spec.priority_column);
    let deleted_at = quote_ident(SOFT_DELETE_COLUMN);

    let selected = spec
        .unique_key_exprs
        .iter()
        .enumerate()
        .map(|(i, expr)| format!("({expr})::text AS key_{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let grouped = spec
        .unique_key_exprs
        .iter()
        .map(|expr| format!("({expr})"))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "SELECT {selected}, \
         array_agg(id ORDER BY {priority} ASC NULLS LAST, id ASC) AS member_ids, \
         COUNT(*) AS member_count \
         FROM {table} \
         WHERE {deleted_at} IS NULL \
         GROUP BY {grouped} \
         HAVING COUNT(*) > 1 \
         ORDER BY MIN({priority}) ASC NULLS LAST, {grouped}"
    )
}

pub async fn find_duplicates(
    pool: &PgPool,
    spec: &TableSpec,
) -> Result<Vec<DuplicateGroup>, sqlx::Error> {
    let rows = sqlx::query(&grouping_sql(spec)).fetch_all(pool).await?;

    let mut groups = Vec::with_capacity(rows.len());
    for row in rows {
        let mut key = Vec::with_capacity(spec.unique_key_exprs.len());
        for i in 0..spec.unique_key_exprs.len() {
            key.push(row.try_get::<Option<String>, _>(format!("key_{i}").as_str())?);
        }
        let member_ids: Vec<Uuid> = row.try_get("member_ids")?;
        if let Some(group) = DuplicateGroup::from_ordered(key, member_ids) {
            groups.push(group);
        }
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouping_query_filters_live_rows_and_orders_by_priority() {
        let spec = TableSpec::entity("leagues", "Leagues", &["name"]);
        let sql = grouping_sql(&spec);
        assert!(sql.contains("(name)::text AS key_0"));
        assert!(sql.contains("array_agg(id ORDER BY \"created_at\" ASC NULLS LAST, id ASC)"));
        assert!(sql.contains("FROM \"leagues\""));
        assert!(sql.contains("WHERE \"deleted_at\" IS NULL"));
        assert!(sql.contains("GROUP BY (name)"));
        assert!(sql.contains("HAVING COUNT(*) > 1"));
    }

    #[test]
    fn opaque_expressions_pass_through_in_order() {
        let spec = TableSpec::relationship(
            "broadcast_rights",
            "Broadcast Rights",
            &[
                "entity_type",
                "COALESCE(division_conference_id, '00000000-0000-0000-0000-000000000000'::uuid)",
            ],
        );
        let sql = grouping_sql(&spec);
        assert!(sql.contains("(entity_type)::text AS key_0"));
        assert!(sql.contains(
            "(COALESCE(division_conference_id, \
             '00000000-0000-0000-0000-000000000000'::uuid))::text AS key_1"
        ));
        assert!(sql.contains(
            "GROUP BY (entity_type), (COALESCE(division_conference_id, \
             '00000000-0000-0000-0000-000000000000'::uuid))"
        ));
    }

    #[test]
    fn custom_priority_column_is_quoted() {
        let mut spec = TableSpec::entity("brands", "Brands", &["name"]);
        spec.priority_column = "updated_at".to_string();
        assert!(grouping_sql(&spec).contains("ORDER BY \"updated_at\" ASC NULLS LAST"));
    }
}
