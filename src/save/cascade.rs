//! Post-commit cascade cleanup.
//!
//! Cascades run only for entities whose deletion durably committed, in a
//! fresh transactional scope: the scope that committed them is already
//! closed. The storage engine's own foreign-key cascade may or may not have
//! removed some dependents already; every delete here is by foreign-id set
//! and idempotent, so it is correct either way.

use super::hooks::HookContext;
use crate::changeset::{ChangeKind, EntityKind};
use thiserror::Error;

/// A post-commit cascade that could not complete.
///
/// The triggering commit is durable and stands. The failure is surfaced to
/// the caller for alerting and is not retried; until an operator intervenes,
/// dependent rows referencing the deleted ids may linger.
#[derive(Debug, Error)]
#[error("cascade cleanup for deleted {kind} rows failed: {source}")]
pub struct CascadeFailure {
    pub kind: EntityKind,
    pub entity_ids: Vec<String>,
    #[source]
    pub source: anyhow::Error,
}

/// Row counts from one cascade hook invocation.
#[derive(Clone, Copy, Debug, Default)]
pub struct CascadeOutcome {
    pub rows_deleted: usize,
}

/// Ids whose latest pending entry in the changeset is a deletion.
fn deleted_ids(ctx: &HookContext, kind: EntityKind) -> Vec<String> {
    let mut ids = Vec::new();
    for entry in ctx.changeset.entries_of(kind) {
        if entry.kind != ChangeKind::Deleted {
            continue;
        }
        let id = entry.entity.id();
        if ctx.changeset.is_pending_deleted(kind, &id) && !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

/// Remove company-map rows referencing releases deleted in the changeset.
pub(super) fn cleanup_release_company_maps(
    ctx: &HookContext,
) -> Result<CascadeOutcome, CascadeFailure> {
    let ids = deleted_ids(ctx, EntityKind::Release);
    if ids.is_empty() {
        return Ok(CascadeOutcome::default());
    }
    match ctx.backend.delete_company_maps_for_releases(&ids) {
        Ok(rows_deleted) => Ok(CascadeOutcome { rows_deleted }),
        Err(source) => Err(CascadeFailure {
            kind: EntityKind::Release,
            entity_ids: ids,
            source,
        }),
    }
}

/// Remove recommendation and related-anime rows referencing anime deleted in
/// the changeset, in both directions, then sweep company maps orphaned by
/// the storage engine's child-release cascade.
pub(super) fn cleanup_anime_relations(
    ctx: &HookContext,
) -> Result<CascadeOutcome, CascadeFailure> {
    let ids = deleted_ids(ctx, EntityKind::Anime);
    if ids.is_empty() {
        return Ok(CascadeOutcome::default());
    }
    let run = || -> anyhow::Result<usize> {
        let mut rows = ctx.backend.delete_recommendations_for_anime(&ids)?;
        rows += ctx.backend.delete_related_links_for_anime(&ids)?;
        rows += ctx.backend.delete_orphaned_company_maps()?;
        Ok(rows)
    };
    match run() {
        Ok(rows_deleted) => Ok(CascadeOutcome { rows_deleted }),
        Err(source) => Err(CascadeFailure {
            kind: EntityKind::Anime,
            entity_ids: ids,
            source,
        }),
    }
}
