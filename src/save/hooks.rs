//! The closed hook set and the context hooks run against.
//!
//! Hooks are a tagged set dispatched by entity type, not an open class
//! hierarchy: pre-commit hooks validate and collect repairs, post-commit
//! hooks run cascade cleanup. A hook only ever reads the changeset; the sole
//! mutations it may produce are violations, repair actions and cascades
//! derived from its own entity type's entries.

use super::cascade::{self, CascadeFailure, CascadeOutcome};
use super::invariants::{self, Violation};
use crate::catalog_store::{CatalogBackend, Release, ReleaseName};
use crate::changeset::{ChangeKind, ChangeSet, EntityKind, EntityRecord};
use anyhow::Result;
use serde::Serialize;

/// Deferred data repair collected during pre-commit and executed inside the
/// same transaction as the changeset, so a rollback undoes it too.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum RepairAction {
    /// Clamp user progress for the anime down to the new episode count.
    ClampEpisodeProgress { anime_id: String, episode_cap: i32 },
}

/// A sibling row as the transaction is about to leave it.
#[derive(Clone, Debug)]
pub struct EffectiveRow<T> {
    pub row: T,
    pub deleted: bool,
}

/// Everything a hook may see: the pending changeset and the committed view.
///
/// Scoped to one transaction; never stored.
pub struct HookContext<'a> {
    pub changeset: &'a ChangeSet,
    pub backend: &'a dyn CatalogBackend,
}

impl HookContext<'_> {
    /// True when the entity is pending-deleted in this changeset, or absent
    /// from committed state with no pending re-add.
    pub fn is_effectively_deleted(&self, kind: EntityKind, id: &str) -> Result<bool> {
        match self.changeset.pending(kind, id) {
            Some(entry) => Ok(entry.kind == ChangeKind::Deleted),
            None => Ok(!self.backend.entity_exists(kind, id)?),
        }
    }

    /// Committed releases of an anime overlaid with this changeset's pending
    /// entries. Pending state wins over committed state for the same id; this
    /// models what the transaction is about to produce, not what is on disk.
    pub fn effective_releases(&self, anime_id: &str) -> Result<Vec<EffectiveRow<Release>>> {
        let mut rows: Vec<EffectiveRow<Release>> = self
            .backend
            .releases_for_anime(anime_id)?
            .into_iter()
            .map(|row| EffectiveRow {
                row,
                deleted: false,
            })
            .collect();

        for entry in self.changeset.entries_of(EntityKind::Release) {
            let EntityRecord::Release(release) = &entry.entity else {
                continue;
            };
            let position = rows.iter().position(|r| r.row.id == release.id);
            let belongs_here = release.anime_id == anime_id;
            match entry.kind {
                ChangeKind::Added | ChangeKind::Modified => {
                    if belongs_here {
                        let effective = EffectiveRow {
                            row: release.clone(),
                            deleted: false,
                        };
                        match position {
                            Some(i) => rows[i] = effective,
                            None => rows.push(effective),
                        }
                    } else if let Some(i) = position {
                        // Re-parented to another anime.
                        rows.remove(i);
                    }
                }
                ChangeKind::Deleted => {
                    if let Some(i) = position {
                        rows[i].deleted = true;
                    } else if belongs_here {
                        rows.push(EffectiveRow {
                            row: release.clone(),
                            deleted: true,
                        });
                    }
                }
            }
        }
        Ok(rows)
    }

    /// Committed names of a release overlaid with this changeset's pending
    /// entries; same resolution rule as `effective_releases`.
    pub fn effective_names(&self, release_id: &str) -> Result<Vec<EffectiveRow<ReleaseName>>> {
        let mut rows: Vec<EffectiveRow<ReleaseName>> = self
            .backend
            .names_for_release(release_id)?
            .into_iter()
            .map(|row| EffectiveRow {
                row,
                deleted: false,
            })
            .collect();

        for entry in self.changeset.entries_of(EntityKind::ReleaseName) {
            let EntityRecord::ReleaseName(name) = &entry.entity else {
                continue;
            };
            let position = rows.iter().position(|r| r.row.id == name.id);
            let belongs_here = name.release_id == release_id;
            match entry.kind {
                ChangeKind::Added | ChangeKind::Modified => {
                    if belongs_here {
                        let effective = EffectiveRow {
                            row: name.clone(),
                            deleted: false,
                        };
                        match position {
                            Some(i) => rows[i] = effective,
                            None => rows.push(effective),
                        }
                    } else if let Some(i) = position {
                        rows.remove(i);
                    }
                }
                ChangeKind::Deleted => {
                    if let Some(i) = position {
                        rows[i].deleted = true;
                    } else if belongs_here {
                        rows.push(EffectiveRow {
                            row: name.clone(),
                            deleted: true,
                        });
                    }
                }
            }
        }
        Ok(rows)
    }
}

// =============================================================================
// Hook Variants
// =============================================================================

/// What a pre-commit hook produced: violations abort the transaction,
/// repairs ride along inside it.
#[derive(Debug, Default)]
pub struct HookOutcome {
    pub violations: Vec<Violation>,
    pub repairs: Vec<RepairAction>,
}

/// Pre-commit hooks, dispatched by entity-type tag via the registry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PreCommitHook {
    /// Release-level invariants (one primary per anime, no orphaned anime,
    /// no primary deleted without replacement) plus the name sub-invariant
    /// for changed releases.
    ReleaseIntegrity,
    /// Exactly-one-primary-name for releases touched by pending name changes.
    ReleaseNameIntegrity,
    /// An anime that is added or kept alive must retain at least one release.
    AnimeReleasePresence,
    /// Episode-count decrease on a primary release clamps user progress.
    EpisodeProgressClamp,
}

impl PreCommitHook {
    pub fn validate(&self, ctx: &HookContext) -> Result<HookOutcome> {
        match self {
            PreCommitHook::ReleaseIntegrity => Ok(HookOutcome {
                violations: invariants::validate_release_changes(ctx)?,
                repairs: Vec::new(),
            }),
            PreCommitHook::ReleaseNameIntegrity => Ok(HookOutcome {
                violations: invariants::validate_name_changes(ctx)?,
                repairs: Vec::new(),
            }),
            PreCommitHook::AnimeReleasePresence => Ok(HookOutcome {
                violations: invariants::validate_anime_release_presence(ctx)?,
                repairs: Vec::new(),
            }),
            PreCommitHook::EpisodeProgressClamp => Ok(HookOutcome {
                violations: Vec::new(),
                repairs: invariants::collect_progress_clamps(ctx)?,
            }),
        }
    }
}

/// Post-commit hooks. Run only after the triggering transaction is durable,
/// each in its own transactional scope.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PostCommitHook {
    /// Remove company-map rows referencing releases deleted in the changeset.
    ReleaseCompanyMapCleanup,
    /// Remove recommendation and related-anime rows referencing anime deleted
    /// in the changeset, in both directions, and sweep company maps orphaned
    /// by the storage engine's child-release cascade.
    AnimeRelationCleanup,
}

impl PostCommitHook {
    pub fn run(&self, ctx: &HookContext) -> Result<CascadeOutcome, CascadeFailure> {
        match self {
            PostCommitHook::ReleaseCompanyMapCleanup => cascade::cleanup_release_company_maps(ctx),
            PostCommitHook::AnimeRelationCleanup => cascade::cleanup_anime_relations(ctx),
        }
    }
}
