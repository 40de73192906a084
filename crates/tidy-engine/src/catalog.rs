//! Static description of every table, relationship, repair, rule, constraint
//! and check the cleanup engine knows about.

use std::collections::HashSet;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tidy_core::{
    ConstraintSpec, IntegrityCheck, IntegrityCheckKind, PolymorphicRef, RepairStrategy,
    RepairTask, StandardizationRule, TableKind, TableSpec, DEFAULT_PRIORITY_COLUMN, ZERO_UUID,
};

use crate::sql::is_safe_identifier;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{context}: `{value}` is not a plain lowercase identifier")]
    UnsafeIdentifier { context: String, value: String },
    #[error("table {table} has an empty or blank unique key expression")]
    EmptyUniqueKey { table: String },
    #[error("{context} references unknown table {table}")]
    UnknownTable { context: String, table: String },
    #[error("standardization pattern `{pattern}` for {table} does not compile: {source}")]
    InvalidPattern {
        table: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("duplicate {kind} name {name}")]
    DuplicateName { kind: &'static str, name: String },
    #[error("reading catalog file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing catalog yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SchemaCatalog {
    #[serde(default)]
    pub tables: Vec<TableSpec>,
    #[serde(default)]
    pub polymorphic_refs: Vec<PolymorphicRef>,
    #[serde(default)]
    pub repairs: Vec<RepairTask>,
    #[serde(default)]
    pub standardization: Vec<StandardizationRule>,
    #[serde(default)]
    pub constraints: Vec<ConstraintSpec>,
    #[serde(default)]
    pub integrity_checks: Vec<IntegrityCheck>,
}

impl SchemaCatalog {
    pub fn from_yaml_str(text: &str) -> Result<Self, CatalogError> {
        let catalog: Self = serde_yaml::from_str(text)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn table(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn priority_column_of(&self, table: &str) -> &str {
        self.table(table)
            .map(|t| t.priority_column.as_str())
            .unwrap_or(DEFAULT_PRIORITY_COLUMN)
    }

    /// Entity tables in declaration order, then relationship tables.
    /// Rewrites while merging entities can create relationship duplicates,
    /// which the later relationship pass removes.
    pub fn dedup_order(&self) -> Vec<&TableSpec> {
        self.tables
            .iter()
            .filter(|t| t.kind == TableKind::Entity)
            .chain(self.tables.iter().filter(|t| t.kind == TableKind::Relationship))
            .collect()
    }

    pub fn polymorphic_refs_to<'a>(
        &'a self,
        table: &'a str,
    ) -> impl Iterator<Item = &'a PolymorphicRef> + 'a {
        self.polymorphic_refs
            .iter()
            .filter(move |r| r.target_table == table)
    }

    /// Tables with standardization rules, in order of first declaration.
    pub fn standardized_tables(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.standardization
            .iter()
            .map(|rule| rule.table.as_str())
            .filter(|table| seen.insert(*table))
            .collect()
    }

    pub fn rules_for(&self, table: &str) -> Vec<&StandardizationRule> {
        self.standardization
            .iter()
            .filter(|rule| rule.table == table)
            .collect()
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut table_names = HashSet::new();
        for table in &self.tables {
            ident("table", &table.name)?;
            ident(&format!("{} priority column", table.name), &table.priority_column)?;
            let keys = &table.unique_key_exprs;
            if keys.is_empty() || keys.iter().any(|e| e.trim().is_empty()) {
                return Err(CatalogError::EmptyUniqueKey {
                    table: table.name.clone(),
                });
            }
            if !table_names.insert(table.name.as_str()) {
                return Err(CatalogError::DuplicateName {
                    kind: "table",
                    name: table.name.clone(),
                });
            }
        }
        let known = |context: &str, table: &str| -> Result<(), CatalogError> {
            if table_names.contains(table) {
                Ok(())
            } else {
                Err(CatalogError::UnknownTable {
                    context: context.to_string(),
                    table: table.to_string(),
                })
            }
        };

        for r in &self.polymorphic_refs {
            ident("polymorphic table", &r.table)?;
            ident("polymorphic type column", &r.type_column)?;
            ident("polymorphic id column", &r.id_column)?;
            known("polymorphic reference", &r.target_table)?;
        }

        let mut repair_names = HashSet::new();
        for task in &self.repairs {
            ident("repair table", &task.table)?;
            unique(&mut repair_names, "repair", &task.name)?;
            match &task.strategy {
                RepairStrategy::AssignFirstCandidate {
                    column,
                    candidate_table,
                    candidate_match_column,
                    row_match_column,
                } => {
                    ident(&task.name, column)?;
                    ident(&task.name, candidate_table)?;
                    ident(&task.name, candidate_match_column)?;
                    ident(&task.name, row_match_column)?;
                }
                RepairStrategy::SetDefault { column, .. } => ident(&task.name, column)?,
                RepairStrategy::InheritFromParent {
                    column,
                    parent_fk,
                    parent_table,
                    parent_column,
                } => {
                    ident(&task.name, column)?;
                    ident(&task.name, parent_fk)?;
                    ident(&task.name, parent_table)?;
                    ident(&task.name, parent_column)?;
                }
            }
        }

        for rule in &self.standardization {
            known("standardization rule", &rule.table)?;
            Regex::new(&rule.pattern).map_err(|source| CatalogError::InvalidPattern {
                table: rule.table.clone(),
                pattern: rule.pattern.clone(),
                source,
            })?;
        }

        let mut constraint_names = HashSet::new();
        for constraint in &self.constraints {
            known("constraint", &constraint.table)?;
            ident("constraint", &constraint.name)?;
            unique(&mut constraint_names, "constraint", &constraint.name)?;
        }

        let mut check_names = HashSet::new();
        for check in &self.integrity_checks {
            unique(&mut check_names, "integrity check", &check.name)?;
            match &check.kind {
                IntegrityCheckKind::OrphanedReference {
                    table,
                    column,
                    parent_table,
                } => {
                    ident(&check.name, table)?;
                    ident(&check.name, column)?;
                    ident(&check.name, parent_table)?;
                }
                IntegrityCheckKind::PolymorphicOrphan {
                    table,
                    type_column,
                    id_column,
                    parent_table,
                    ..
                } => {
                    ident(&check.name, table)?;
                    ident(&check.name, type_column)?;
                    ident(&check.name, id_column)?;
                    ident(&check.name, parent_table)?;
                }
                IntegrityCheckKind::InvalidDateRange {
                    table,
                    start_column,
                    end_column,
                } => {
                    ident(&check.name, table)?;
                    ident(&check.name, start_column)?;
                    ident(&check.name, end_column)?;
                }
            }
        }
        Ok(())
    }

    /// The sports-broadcast schema this engine was built for.
    pub fn builtin() -> Self {
        let nullable_division =
            format!("COALESCE(division_conference_id, '{ZERO_UUID}'::uuid)");

        let tables = vec![
            TableSpec::entity("sports", "Sports", &["name"]),
            TableSpec::entity("leagues", "Leagues", &["name"]),
            TableSpec::entity(
                "division_conferences",
                "Divisions / Conferences",
                &["league_id", "name"],
            ),
            TableSpec::entity("teams", "Teams", &["league_id", "name"]),
            TableSpec::entity("broadcast_companies", "Broadcast Companies", &["name"]),
            TableSpec::entity("production_companies", "Production Companies", &["name"]),
            TableSpec::entity("brands", "Brands", &["name"]),
            TableSpec::relationship(
                "broadcast_rights",
                "Broadcast Rights",
                &[
                    "entity_type",
                    "entity_id",
                    "broadcast_company_id",
                    nullable_division.as_str(),
                ],
            ),
            TableSpec::relationship(
                "production_services",
                "Production Services",
                &[
                    "entity_type",
                    "entity_id",
                    "production_company_id",
                    "service_type",
                ],
            ),
        ];

        let mut polymorphic_refs = Vec::new();
        let mut integrity_checks = Vec::new();
        for relationship in ["broadcast_rights", "production_services"] {
            for (entity_type, target_table) in [
                ("league", "leagues"),
                ("division_conference", "division_conferences"),
                ("team", "teams"),
            ] {
                polymorphic_refs.push(PolymorphicRef {
                    table: relationship.to_string(),
                    type_column: "entity_type".to_string(),
                    id_column: "entity_id".to_string(),
                    entity_type: entity_type.to_string(),
                    target_table: target_table.to_string(),
                });
                integrity_checks.push(IntegrityCheck {
                    name: format!("{relationship}_orphaned_{entity_type}"),
                    display_name: format!("{relationship} pointing at a missing {entity_type}"),
                    kind: IntegrityCheckKind::PolymorphicOrphan {
                        table: relationship.to_string(),
                        type_column: "entity_type".to_string(),
                        id_column: "entity_id".to_string(),
                        entity_type: entity_type.to_string(),
                        parent_table: target_table.to_string(),
                    },
                });
            }
        }

        for (name, display_name, table, column, parent_table) in [
            (
                "leagues_orphaned_sport",
                "Leagues without a live sport",
                "leagues",
                "sport_id",
                "sports",
            ),
            (
                "divisions_orphaned_league",
                "Divisions without a live league",
                "division_conferences",
                "league_id",
                "leagues",
            ),
            (
                "teams_orphaned_league",
                "Teams without a live league",
                "teams",
                "league_id",
                "leagues",
            ),
            (
                "teams_orphaned_division",
                "Teams without a live division",
                "teams",
                "division_conference_id",
                "division_conferences",
            ),
            (
                "broadcast_rights_orphaned_company",
                "Broadcast rights without a live broadcaster",
                "broadcast_rights",
                "broadcast_company_id",
                "broadcast_companies",
            ),
            (
                "production_services_orphaned_company",
                "Production services without a live producer",
                "production_services",
                "production_company_id",
                "production_companies",
            ),
        ] {
            integrity_checks.push(IntegrityCheck {
                name: name.to_string(),
                display_name: display_name.to_string(),
                kind: IntegrityCheckKind::OrphanedReference {
                    table: table.to_string(),
                    column: column.to_string(),
                    parent_table: parent_table.to_string(),
                },
            });
        }

        for table in ["broadcast_rights", "production_services"] {
            integrity_checks.push(IntegrityCheck {
                name: format!("{table}_invalid_date_range"),
                display_name: format!("{table} ending before they start"),
                kind: IntegrityCheckKind::InvalidDateRange {
                    table: table.to_string(),
                    start_column: "start_date".to_string(),
                    end_column: "end_date".to_string(),
                },
            });
        }

        let repairs = vec![
            RepairTask {
                name: "teams_missing_division".to_string(),
                display_name: "Teams without a division".to_string(),
                table: "teams".to_string(),
                strategy: RepairStrategy::AssignFirstCandidate {
                    column: "division_conference_id".to_string(),
                    candidate_table: "division_conferences".to_string(),
                    candidate_match_column: "league_id".to_string(),
                    row_match_column: "league_id".to_string(),
                },
            },
            RepairTask {
                name: "teams_league_mismatch".to_string(),
                display_name: "Teams whose league disagrees with their division".to_string(),
                table: "teams".to_string(),
                strategy: RepairStrategy::InheritFromParent {
                    column: "league_id".to_string(),
                    parent_fk: "division_conference_id".to_string(),
                    parent_table: "division_conferences".to_string(),
                    parent_column: "league_id".to_string(),
                },
            },
            RepairTask {
                name: "broadcast_rights_missing_territory".to_string(),
                display_name: "Broadcast rights without a territory".to_string(),
                table: "broadcast_rights".to_string(),
                strategy: RepairStrategy::SetDefault {
                    column: "territory".to_string(),
                    value: "National".to_string(),
                },
            },
        ];

        let mut standardization = Vec::new();
        for table in ["leagues", "teams", "broadcast_companies", "production_companies", "brands"] {
            standardization.push(StandardizationRule::new(table, r"\s{2,}", " "));
            standardization.push(StandardizationRule::new(table, r"^\s+|\s+$", ""));
        }
        standardization.push(StandardizationRule::new(
            "leagues",
            r"^(.+?)\s*\([A-Z]{2,6}\)$",
            "${1}",
        ));
        standardization.push(StandardizationRule::new("teams", "&amp;", "&"));
        for table in ["broadcast_companies", "production_companies"] {
            standardization.push(StandardizationRule::new(
                table,
                r",?\s+(?:Inc\.?|LLC|Corp\.?)$",
                "",
            ));
        }

        let constraints = vec![
            ConstraintSpec::new("sports", "uq_sports_name", "UNIQUE (name)"),
            ConstraintSpec::new("leagues", "uq_leagues_name", "UNIQUE (name)"),
            ConstraintSpec::new(
                "division_conferences",
                "uq_division_conferences_league_name",
                "UNIQUE (league_id, name)",
            ),
            ConstraintSpec::new("teams", "uq_teams_league_name", "UNIQUE (league_id, name)"),
            ConstraintSpec::new(
                "broadcast_companies",
                "uq_broadcast_companies_name",
                "UNIQUE (name)",
            ),
            ConstraintSpec::new(
                "production_companies",
                "uq_production_companies_name",
                "UNIQUE (name)",
            ),
            ConstraintSpec::new("brands", "uq_brands_name", "UNIQUE (name)"),
            ConstraintSpec::new(
                "broadcast_rights",
                "uq_broadcast_rights_entity_company_division",
                "UNIQUE NULLS NOT DISTINCT \
                 (entity_type, entity_id, broadcast_company_id, division_conference_id)",
            ),
            ConstraintSpec::new(
                "production_services",
                "uq_production_services_entity_company_type",
                "UNIQUE (entity_type, entity_id, production_company_id, service_type)",
            ),
        ];

        Self {
            tables,
            polymorphic_refs,
            repairs,
            standardization,
            constraints,
            integrity_checks,
        }
    }
}

fn ident(context: &str, value: &str) -> Result<(), CatalogError> {
    if is_safe_identifier(value) {
        Ok(())
    } else {
        Err(CatalogError::UnsafeIdentifier {
            context: context.to_string(),
            value: value.to_string(),
        })
    }
}

fn unique<'a>(
    seen: &mut HashSet<&'a str>,
    kind: &'static str,
    name: &'a str,
) -> Result<(), CatalogError> {
    if seen.insert(name) {
        Ok(())
    } else {
        Err(CatalogError::DuplicateName {
            kind,
            name: name.to_string(),
        })
    }
}
