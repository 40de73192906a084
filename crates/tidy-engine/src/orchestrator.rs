//! Runs the cleanup phases in their fixed order and owns the run's report.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sqlx::PgPool;
use tidy_core::{CleanupReport, Phase};
use tracing::{error, info, info_span, warn, Instrument};

use crate::catalog::SchemaCatalog;
use crate::error::RunError;
use crate::{constraints, dedup, integrity, repair, standardize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub dry_run: bool,
    /// Whether a human is present to confirm destructive work.
    pub interactive: bool,
}

/// Asked once before an interactive apply run touches any row.
pub trait Confirm: Send + Sync {
    fn confirm(&self, catalog: &SchemaCatalog) -> bool;
}

pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, _catalog: &SchemaCatalog) -> bool {
        true
    }
}

pub struct Decline;

impl Confirm for Decline {
    fn confirm(&self, _catalog: &SchemaCatalog) -> bool {
        false
    }
}

/// Cooperative cancellation, checked between tables, tasks and phases.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    DuplicatesPhase,
    RelationshipsPhase,
    StandardizationPhase,
    ConstraintsPhase,
    IntegrityPhase,
    Finalized,
}

impl RunState {
    /// Transitions are sequential and do not depend on phase outcomes.
    pub fn next(self) -> Self {
        match self {
            RunState::Idle => RunState::DuplicatesPhase,
            RunState::DuplicatesPhase => RunState::RelationshipsPhase,
            RunState::RelationshipsPhase => RunState::StandardizationPhase,
            RunState::StandardizationPhase => RunState::ConstraintsPhase,
            RunState::ConstraintsPhase => RunState::IntegrityPhase,
            RunState::IntegrityPhase | RunState::Finalized => RunState::Finalized,
        }
    }

    pub fn phase(self) -> Option<Phase> {
        match self {
            RunState::DuplicatesPhase => Some(Phase::Duplicates),
            RunState::RelationshipsPhase => Some(Phase::Relationships),
            RunState::StandardizationPhase => Some(Phase::Standardization),
            RunState::ConstraintsPhase => Some(Phase::Constraints),
            RunState::IntegrityPhase => Some(Phase::Integrity),
            RunState::Idle | RunState::Finalized => None,
        }
    }
}

/// Per-run state shared by the phases. Nothing here outlives one run.
pub(crate) struct RunContext<'a> {
    pub pool: &'a PgPool,
    pub catalog: &'a SchemaCatalog,
    pub dry_run: bool,
    pub cancel: &'a CancelFlag,
    /// Tables whose detection failed; later phases leave them alone.
    pub skipped_tables: HashSet<String>,
}

impl RunContext<'_> {
    pub fn checkpoint(&self, phase: Phase) -> Result<(), RunError> {
        if self.cancel.is_cancelled() {
            return Err(RunError::Cancelled { phase });
        }
        Ok(())
    }
}

pub struct CleanupOrchestrator<'a> {
    pool: &'a PgPool,
    catalog: &'a SchemaCatalog,
    options: RunOptions,
}

impl<'a> CleanupOrchestrator<'a> {
    pub fn new(pool: &'a PgPool, catalog: &'a SchemaCatalog, options: RunOptions) -> Self {
        Self {
            pool,
            catalog,
            options,
        }
    }

    pub async fn run(
        &self,
        confirm: &dyn Confirm,
        cancel: &CancelFlag,
    ) -> Result<CleanupReport, RunError> {
        let report = CleanupReport::new(self.options.dry_run);
        let span = info_span!(
            "cleanup_run",
            run_id = %report.run_id,
            dry_run = self.options.dry_run
        );
        self.run_phases(report, confirm, cancel).instrument(span).await
    }

    async fn run_phases(
        &self,
        mut report: CleanupReport,
        confirm: &dyn Confirm,
        cancel: &CancelFlag,
    ) -> Result<CleanupReport, RunError> {
        self.catalog.validate()?;

        if self.options.interactive && !self.options.dry_run && !confirm.confirm(self.catalog) {
            warn!("cleanup declined at confirmation");
            report.mark_skipped();
            report.finalize();
            return Ok(report);
        }

        let mut ctx = RunContext {
            pool: self.pool,
            catalog: self.catalog,
            dry_run: self.options.dry_run,
            cancel,
            skipped_tables: HashSet::new(),
        };
        ctx.checkpoint(Phase::Duplicates)?;

        if let Err(err) = sqlx::query("SELECT 1").execute(self.pool).await {
            error!(error = %err, "database unreachable");
            return Err(RunError::Connectivity(err));
        }

        let mut state = RunState::Idle.next();
        while let Some(phase) = state.phase() {
            ctx.checkpoint(phase)?;
            let phase_span = info_span!("phase", phase = %phase);
            let result = match phase {
                Phase::Duplicates => {
                    dedup::run_phase(&mut ctx, &mut report)
                        .instrument(phase_span)
                        .await
                }
                Phase::Relationships => {
                    repair::run_phase(&mut ctx, &mut report)
                        .instrument(phase_span)
                        .await
                }
                Phase::Standardization => {
                    standardize::run_phase(&mut ctx, &mut report)
                        .instrument(phase_span)
                        .await
                }
                Phase::Constraints => {
                    constraints::run_phase(&mut ctx, &mut report)
                        .instrument(phase_span)
                        .await
                }
                Phase::Integrity => {
                    integrity::run_phase(&mut ctx, &mut report)
                        .instrument(phase_span)
                        .await
                }
            };
            if let Err(err) = result {
                match &err {
                    RunError::Cancelled { .. } => warn!(error = %err, "cleanup cancelled"),
                    _ => error!(error = %err, "cleanup aborted"),
                }
                return Err(err);
            }
            state = state.next();
        }

        report.finalize();
        info!(
            success = report.success,
            errors = report.errors.len(),
            found = report.total_duplicates_found(),
            removed = report.total_duplicates_removed(),
            "cleanup finished"
        );
        Ok(report)
    }
}
