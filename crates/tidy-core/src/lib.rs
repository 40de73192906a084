//! Core domain model for the Tidy cleanup & integrity repair engine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tidy-core";

pub const DEFAULT_PRIORITY_COLUMN: &str = "created_at";
pub const SOFT_DELETE_COLUMN: &str = "deleted_at";
pub const NAME_COLUMN: &str = "name";

pub const DUPLICATE_SAMPLE_LIMIT: usize = 3;
pub const REPAIR_SAMPLE_LIMIT: usize = 3;
pub const INTEGRITY_SAMPLE_LIMIT: usize = 5;

/// Placeholder used when grouping nullable uuid keys, so two NULLs compare equal.
pub const ZERO_UUID: &str = "00000000-0000-0000-0000-000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    #[default]
    Entity,
    Relationship,
}

/// A table subject to cleanup and the expressions that define "the same row".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub display_name: String,
    /// Column names or opaque SQL expressions, grouped in this order.
    pub unique_key_exprs: Vec<String>,
    #[serde(default = "default_priority_column")]
    pub priority_column: String,
    #[serde(default)]
    pub kind: TableKind,
}

fn default_priority_column() -> String {
    DEFAULT_PRIORITY_COLUMN.to_string()
}

impl TableSpec {
    pub fn entity(name: &str, display_name: &str, unique_key_exprs: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            unique_key_exprs: unique_key_exprs.iter().map(|e| e.to_string()).collect(),
            priority_column: default_priority_column(),
            kind: TableKind::Entity,
        }
    }

    pub fn relationship(name: &str, display_name: &str, unique_key_exprs: &[&str]) -> Self {
        Self {
            kind: TableKind::Relationship,
            ..Self::entity(name, display_name, unique_key_exprs)
        }
    }
}

/// A `(type, id)` reference into `target_table` that has no declared foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolymorphicRef {
    pub table: String,
    pub type_column: String,
    pub id_column: String,
    pub entity_type: String,
    pub target_table: String,
}

/// Live rows sharing one unique-key value, ordered by priority (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    key: Vec<Option<String>>,
    member_ids: Vec<Uuid>,
}

impl DuplicateGroup {
    /// Builds a group from an already priority-ordered id list.
    /// Returns `None` unless there is at least one row to delete.
    pub fn from_ordered(key: Vec<Option<String>>, member_ids: Vec<Uuid>) -> Option<Self> {
        if member_ids.len() < 2 {
            return None;
        }
        Some(Self { key, member_ids })
    }

    pub fn key(&self) -> &[Option<String>] {
        &self.key
    }

    pub fn member_ids(&self) -> &[Uuid] {
        &self.member_ids
    }

    pub fn keep_id(&self) -> Uuid {
        self.member_ids[0]
    }

    pub fn delete_ids(&self) -> &[Uuid] {
        &self.member_ids[1..]
    }

    pub fn sample(&self) -> DuplicateSample {
        DuplicateSample {
            key: self.key.clone(),
            keep_id: self.keep_id(),
            delete_ids: self.delete_ids().to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateSample {
    pub key: Vec<Option<String>>,
    pub keep_id: Uuid,
    pub delete_ids: Vec<Uuid>,
}

/// One structural defect class and the closed-form fix for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairTask {
    pub name: String,
    pub display_name: String,
    pub table: String,
    pub strategy: RepairStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepairStrategy {
    /// Fill a NULL reference with the first live candidate sharing
    /// `row_match_column = candidate_match_column`, ordered by the candidate's
    /// priority column then id. Heuristic: the choice has no business-rule basis.
    AssignFirstCandidate {
        column: String,
        candidate_table: String,
        candidate_match_column: String,
        row_match_column: String,
    },
    /// Bulk-fill NULLs in `column` with a literal value.
    SetDefault { column: String, value: String },
    /// Copy `parent_column` from the row referenced by `parent_fk` when they disagree.
    InheritFromParent {
        column: String,
        parent_fk: String,
        parent_table: String,
        parent_column: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairSample {
    pub id: Uuid,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardizationRule {
    pub table: String,
    pub pattern: String,
    pub replacement: String,
}

impl StandardizationRule {
    pub fn new(table: &str, pattern: &str, replacement: &str) -> Self {
        Self {
            table: table.to_string(),
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintSpec {
    pub table: String,
    pub name: String,
    /// SQL fragment following `ADD CONSTRAINT <name>`.
    pub definition: String,
}

impl ConstraintSpec {
    pub fn new(table: &str, name: &str, definition: &str) -> Self {
        Self {
            table: table.to_string(),
            name: name.to_string(),
            definition: definition.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintOutcome {
    Added,
    Skipped,
    WouldAdd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityCheck {
    pub name: String,
    pub display_name: String,
    pub kind: IntegrityCheckKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityCheckKind {
    /// Live rows whose `column` points at a missing or soft-deleted parent.
    OrphanedReference {
        table: String,
        column: String,
        parent_table: String,
    },
    PolymorphicOrphan {
        table: String,
        type_column: String,
        id_column: String,
        entity_type: String,
        parent_table: String,
    },
    InvalidDateRange {
        table: String,
        start_column: String,
        end_column: String,
    },
}

impl IntegrityCheckKind {
    pub fn table(&self) -> &str {
        match self {
            Self::OrphanedReference { table, .. }
            | Self::PolymorphicOrphan { table, .. }
            | Self::InvalidDateRange { table, .. } => table,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityRow {
    pub id: Uuid,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IntegrityIssue {
    pub count: u64,
    pub sample: Vec<IntegrityRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Duplicates,
    Relationships,
    Standardization,
    Constraints,
    Integrity,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Duplicates,
        Phase::Relationships,
        Phase::Standardization,
        Phase::Constraints,
        Phase::Integrity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Duplicates => "duplicates",
            Phase::Relationships => "relationships",
            Phase::Standardization => "standardization",
            Phase::Constraints => "constraints",
            Phase::Integrity => "integrity",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recoverable failure captured during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupIssue {
    pub phase: Phase,
    pub table: Option<String>,
    pub message: String,
}

impl fmt::Display for CleanupIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "[{}] {}: {}", self.phase, table, self.message),
            None => write!(f, "[{}] {}", self.phase, self.message),
        }
    }
}

/// Key under which callers persist a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Cleanup,
    DryRun,
}

impl Operation {
    pub fn for_dry_run(dry_run: bool) -> Self {
        if dry_run {
            Operation::DryRun
        } else {
            Operation::Cleanup
        }
    }

    pub fn as_key(self) -> &'static str {
        match self {
            Operation::Cleanup => "cleanup",
            Operation::DryRun => "dry_run",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key())
    }
}

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_SKIPPED: i32 = 2;
/// No report exists: the run aborted or another run held the lock.
pub const EXIT_NO_REPORT: i32 = 3;

/// Outcome of one orchestration run. Created fresh per run, mutated by each
/// phase, finalized once. The engine never persists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub duplicates_found: BTreeMap<String, u64>,
    pub duplicate_groups: BTreeMap<String, u64>,
    pub duplicates_removed: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub duplicate_samples: BTreeMap<String, Vec<DuplicateSample>>,
    pub relationships_repaired: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub repair_samples: BTreeMap<String, Vec<RepairSample>>,
    pub names_standardized: BTreeMap<String, u64>,
    pub constraints_added: Vec<String>,
    pub constraints_skipped: Vec<String>,
    pub constraints_pending: Vec<String>,
    pub integrity_issues: BTreeMap<String, IntegrityIssue>,
    pub errors: Vec<CleanupIssue>,
    pub success: bool,
    pub skipped: bool,
}

impl CleanupReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            dry_run,
            duplicates_found: BTreeMap::new(),
            duplicate_groups: BTreeMap::new(),
            duplicates_removed: BTreeMap::new(),
            duplicate_samples: BTreeMap::new(),
            relationships_repaired: BTreeMap::new(),
            repair_samples: BTreeMap::new(),
            names_standardized: BTreeMap::new(),
            constraints_added: Vec::new(),
            constraints_skipped: Vec::new(),
            constraints_pending: Vec::new(),
            integrity_issues: BTreeMap::new(),
            errors: Vec::new(),
            success: false,
            skipped: false,
        }
    }

    pub fn record_issue(&mut self, phase: Phase, table: Option<&str>, message: impl Into<String>) {
        self.errors.push(CleanupIssue {
            phase,
            table: table.map(str::to_string),
            message: message.into(),
        });
    }

    pub fn issues_for(&self, phase: Phase) -> impl Iterator<Item = &CleanupIssue> {
        self.errors.iter().filter(move |issue| issue.phase == phase)
    }

    pub fn record_constraint(&mut self, name: &str, outcome: ConstraintOutcome) {
        let bucket = match outcome {
            ConstraintOutcome::Added => &mut self.constraints_added,
            ConstraintOutcome::Skipped => &mut self.constraints_skipped,
            ConstraintOutcome::WouldAdd => &mut self.constraints_pending,
        };
        bucket.push(name.to_string());
    }

    /// Marks the run as declined before any phase executed.
    pub fn mark_skipped(&mut self) {
        self.skipped = true;
    }

    pub fn finalize(&mut self) {
        self.finished_at = Some(Utc::now());
        self.success = !self.skipped && self.errors.is_empty();
    }

    pub fn total_duplicates_found(&self) -> u64 {
        self.duplicates_found.values().sum()
    }

    pub fn total_duplicates_removed(&self) -> u64 {
        self.duplicates_removed.values().sum()
    }

    pub fn exit_code(&self) -> i32 {
        if self.skipped {
            EXIT_SKIPPED
        } else if self.success {
            EXIT_SUCCESS
        } else {
            EXIT_FAILURE
        }
    }

    /// Human-readable multi-line summary for terminals and logs.
    pub fn summary_text(&self) -> String {
        let mode = if self.dry_run { "dry-run" } else { "apply" };
        let mut lines = vec![format!("# Cleanup report `{}` ({mode})", self.run_id)];

        if self.skipped {
            lines.push("- skipped: confirmation declined, nothing was changed".to_string());
            return lines.join("\n");
        }

        lines.push(String::new());
        lines.push("## Duplicates".to_string());
        for (table, found) in &self.duplicates_found {
            let groups = self.duplicate_groups.get(table).copied().unwrap_or(0);
            match self.duplicates_removed.get(table) {
                Some(removed) => lines.push(format!(
                    "- {table}: {found} found in {groups} groups, {removed} removed"
                )),
                None => lines.push(format!("- {table}: {found} found in {groups} groups")),
            }
        }

        lines.push(String::new());
        lines.push("## Relationships".to_string());
        push_counts(&mut lines, &self.relationships_repaired, self.dry_run);

        lines.push(String::new());
        lines.push("## Standardization".to_string());
        push_counts(&mut lines, &self.names_standardized, self.dry_run);

        lines.push(String::new());
        lines.push("## Constraints".to_string());
        lines.push(format!("- added: {}", join_or_none(&self.constraints_added)));
        lines.push(format!("- already present: {}", join_or_none(&self.constraints_skipped)));
        if self.dry_run {
            lines.push(format!("- would add: {}", join_or_none(&self.constraints_pending)));
        }

        lines.push(String::new());
        lines.push("## Integrity".to_string());
        if self.integrity_issues.values().all(|issue| issue.count == 0) {
            lines.push("- no issues".to_string());
        }
        for (name, issue) in &self.integrity_issues {
            if issue.count > 0 {
                lines.push(format!("- {name}: {}", issue.count));
            }
        }

        lines.push(String::new());
        lines.push(format!("## Errors ({})", self.errors.len()));
        for issue in &self.errors {
            lines.push(format!("- {issue}"));
        }

        lines.push(String::new());
        lines.push(format!("success: {}", self.success));
        lines.join("\n")
    }
}

fn push_counts(lines: &mut Vec<String>, counts: &BTreeMap<String, u64>, dry_run: bool) {
    if counts.is_empty() {
        lines.push("- nothing to do".to_string());
    }
    let verb = if dry_run { "would fix" } else { "fixed" };
    for (name, count) in counts {
        lines.push(format!("- {name}: {verb} {count}"));
    }
}

fn join_or_none(names: &[String]) -> String {
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}
