//! Save-time invariant enforcement and cascade engine.
//!
//! The engine sits between business operations and the catalog store. A
//! caller accumulates mutations in a [`ChangeSet`] and hands it to
//! [`SaveEngine::save`], which runs three phases:
//!
//! 1. **Pre-commit**: for every changed entity type, in registry order, the
//!    matching validators check cross-row invariants against pending plus
//!    committed state. Any violation aborts the save; nothing is written.
//! 2. **Commit**: the changeset and any collected repair actions are applied
//!    in a single storage transaction.
//! 3. **Post-commit**: cascade hooks clean up dependent join rows in fresh
//!    transactional scopes. Their failures are reported, never rolled back.

mod cascade;
mod hooks;
mod invariants;
mod registry;

pub use cascade::{CascadeFailure, CascadeOutcome};
pub use hooks::{EffectiveRow, HookContext, HookOutcome, PostCommitHook, PreCommitHook, RepairAction};
pub use invariants::Violation;
pub use registry::{ConfigurationError, HookRegistry};

use crate::catalog_store::CatalogBackend;
use crate::changeset::ChangeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a save did not complete normally.
#[derive(Debug, Error)]
pub enum SaveError {
    /// One or more invariants failed during pre-commit. The transaction was
    /// aborted and nothing was written.
    #[error("changeset validation failed with {} violation(s)", .0.len())]
    Validation(Vec<Violation>),
    /// The save was cancelled before the commit was issued.
    #[error("save cancelled before commit")]
    Cancelled,
    /// The storage layer failed while validating or committing.
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

/// What a completed save did.
#[derive(Debug)]
pub struct SaveReport {
    pub changeset_id: String,
    pub entries_applied: usize,
    /// Progress rows clamped by repair actions.
    pub repair_rows: usize,
    /// Join rows removed by post-commit cascades.
    pub cascade_rows_deleted: usize,
    /// True when a cancellation arrived after the commit; the commit stands
    /// but no cascades were scheduled.
    pub cascades_skipped: bool,
    /// Cascades that failed after the commit. The commit is durable; these
    /// need operator attention.
    pub cascade_failures: Vec<CascadeFailure>,
}

/// The save engine. Cheap to share: it owns only the backend handle and the
/// immutable hook registry.
#[derive(Debug)]
pub struct SaveEngine<B: CatalogBackend> {
    backend: Arc<B>,
    registry: HookRegistry,
}

impl<B: CatalogBackend> SaveEngine<B> {
    /// Build an engine over the standard hook registry, verifying that every
    /// hooked entity type has a storage mapping in the backend.
    pub fn new(backend: Arc<B>) -> Result<Self, ConfigurationError> {
        let registry = HookRegistry::standard();
        registry.verify_mappings(backend.mapped_kinds())?;
        Ok(Self { backend, registry })
    }

    /// Validate and commit a changeset, then run post-commit cascades.
    pub fn save(&self, changeset: ChangeSet) -> Result<SaveReport, SaveError> {
        self.save_with_abort(changeset, &AtomicBool::new(false))
    }

    /// Like [`save`](Self::save), but honoring a caller-owned abort flag.
    ///
    /// The save is abortable up to the point the commit is issued. Once the
    /// commit has been sent, a set flag only prevents post-commit cascades
    /// from being scheduled; it cannot undo the commit.
    pub fn save_with_abort(
        &self,
        changeset: ChangeSet,
        abort: &AtomicBool,
    ) -> Result<SaveReport, SaveError> {
        let ctx = HookContext {
            changeset: &changeset,
            backend: self.backend.as_ref(),
        };

        // Phase 1: pre-commit validation, in registration order.
        let mut violations: Vec<Violation> = Vec::new();
        let mut repairs: Vec<RepairAction> = Vec::new();
        for kind in self.registry.kinds() {
            if changeset.entries_of(kind).next().is_none() {
                continue;
            }
            for hook in self.registry.pre_commit_hooks(kind) {
                if abort.load(Ordering::SeqCst) {
                    return Err(SaveError::Cancelled);
                }
                let outcome = hook.validate(&ctx).map_err(SaveError::Storage)?;
                for violation in outcome.violations {
                    if !violations.contains(&violation) {
                        violations.push(violation);
                    }
                }
                repairs.extend(outcome.repairs);
            }
        }
        if !violations.is_empty() {
            debug!(
                changeset = changeset.id(),
                count = violations.len(),
                "changeset rejected"
            );
            return Err(SaveError::Validation(violations));
        }
        if abort.load(Ordering::SeqCst) {
            return Err(SaveError::Cancelled);
        }

        // Phase 2: commit.
        let stats = self
            .backend
            .apply_changeset(&changeset, &repairs)
            .map_err(SaveError::Storage)?;
        debug!(
            changeset = changeset.id(),
            entries = stats.entries_applied,
            repair_rows = stats.repair_rows,
            "changeset committed"
        );

        let mut report = SaveReport {
            changeset_id: changeset.id().to_string(),
            entries_applied: stats.entries_applied,
            repair_rows: stats.repair_rows,
            cascade_rows_deleted: 0,
            cascades_skipped: false,
            cascade_failures: Vec::new(),
        };

        // Phase 3: post-commit cascades. The commit is durable from here on.
        if abort.load(Ordering::SeqCst) {
            report.cascades_skipped = true;
            return Ok(report);
        }
        for kind in self.registry.kinds() {
            if changeset.entries_of(kind).next().is_none() {
                continue;
            }
            for hook in self.registry.post_commit_hooks(kind) {
                match hook.run(&ctx) {
                    Ok(outcome) => report.cascade_rows_deleted += outcome.rows_deleted,
                    Err(failure) => {
                        warn!(changeset = changeset.id(), %failure, "post-commit cascade failed");
                        report.cascade_failures.push(failure);
                    }
                }
            }
        }
        Ok(report)
    }
}
