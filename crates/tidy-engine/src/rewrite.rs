//! Re-points dependent rows at the surviving row of a duplicate group.

use sqlx::{PgConnection, PgPool};
use tidy_core::PolymorphicRef;
use uuid::Uuid;

use crate::catalog::SchemaCatalog;
use crate::sql::{is_safe_identifier, quote_ident};

/// A column elsewhere in the schema that stores ids of the deduplicated table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependent {
    ForeignKey { table: String, column: String },
    Polymorphic(PolymorphicRef),
}

impl Dependent {
    pub fn table(&self) -> &str {
        match self {
            Dependent::ForeignKey { table, .. } => table,
            Dependent::Polymorphic(r) => &r.table,
        }
    }
}

/// Single-column foreign keys in the current schema that reference `$1.id`.
const FOREIGN_KEYS_SQL: &str = "\
SELECT DISTINCT child.relname::text AS dependent_table, att.attname::text AS dependent_column
FROM pg_constraint con
JOIN pg_class parent ON parent.oid = con.confrelid
JOIN pg_class child ON child.oid = con.conrelid
JOIN pg_namespace ns ON ns.oid = parent.relnamespace
JOIN pg_attribute att ON att.attrelid = con.conrelid AND att.attnum = con.conkey[1]
JOIN pg_attribute pk ON pk.attrelid = con.confrelid AND pk.attnum = con.confkey[1]
WHERE con.contype = 'f'
  AND cardinality(con.conkey) = 1
  AND ns.nspname = current_schema()
  AND child.relnamespace = ns.oid
  AND parent.relname = $1
  AND pk.attname = 'id'
ORDER BY 1, 2";

/// Declared foreign keys into `table.id` plus catalog-listed polymorphic refs.
/// Introspected names that would need quoting are ignored.
pub async fn discover_dependents(
    pool: &PgPool,
    catalog: &SchemaCatalog,
    table: &str,
) -> Result<Vec<Dependent>, sqlx::Error> {
    let rows: Vec<(String, String)> = sqlx::query_as(FOREIGN_KEYS_SQL)
        .bind(table)
        .fetch_all(pool)
        .await?;

    let mut dependents = rows
        .into_iter()
        .filter(|(t, c)| is_safe_identifier(t) && is_safe_identifier(c))
        .map(|(table, column)| Dependent::ForeignKey { table, column })
        .collect::<Vec<_>>();
    dependents.extend(
        catalog
            .polymorphic_refs_to(table)
            .cloned()
            .map(Dependent::Polymorphic),
    );
    Ok(dependents)
}

pub fn rewrite_sql(dependent: &Dependent) -> String {
    match dependent {
        Dependent::ForeignKey { table, column } => {
            let column = quote_ident(column);
            format!(
                "UPDATE {} SET {column} = $1 WHERE {column} = ANY($2)",
                quote_ident(table)
            )
        }
        Dependent::Polymorphic(r) => {
            let id_column = quote_ident(&r.id_column);
            format!(
                "UPDATE {} SET {id_column} = $1 WHERE {id_column} = ANY($2) AND {} = $3",
                quote_ident(&r.table),
                quote_ident(&r.type_column)
            )
        }
    }
}

/// Rewrites every dependent of one group on `conn`. Returns rows touched.
/// The caller owns the surrounding transaction/savepoint.
pub async fn rewrite_dependents(
    conn: &mut PgConnection,
    dependents: &[Dependent],
    keep_id: Uuid,
    delete_ids: &[Uuid],
) -> Result<u64, sqlx::Error> {
    let mut touched = 0;
    for dependent in dependents {
        let sql = rewrite_sql(dependent);
        let query = sqlx::query(&sql).bind(keep_id).bind(delete_ids);
        let query = match dependent {
            Dependent::ForeignKey { .. } => query,
            Dependent::Polymorphic(r) => query.bind(r.entity_type.as_str()),
        };
        touched += query.execute(&mut *conn).await?.rows_affected();
    }
    Ok(touched)
}
