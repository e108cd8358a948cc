//! CatalogBackend trait definition.
//!
//! The save engine's only view of storage. It covers the three capabilities
//! the engine consumes: committed-state queries for sibling rows, a
//! transactional changeset commit, and the bulk primitives post-commit
//! cascades are built from. Implemented by `SqliteCatalogStore`; tests wrap
//! or substitute it.

use super::models::{Release, ReleaseName};
use crate::changeset::{ChangeSet, EntityKind};
use crate::save::RepairAction;
use anyhow::Result;

/// Row counts from a committed changeset application.
#[derive(Clone, Copy, Debug, Default)]
pub struct ApplyStats {
    pub entries_applied: usize,
    pub repair_rows: usize,
}

pub trait CatalogBackend: Send + Sync {
    // =========================================================================
    // Committed State
    // =========================================================================

    /// Whether a committed row with this identity exists. Join rows use their
    /// composite `EntityRecord` id.
    fn entity_exists(&self, kind: EntityKind, id: &str) -> Result<bool>;

    /// All committed releases of an anime.
    fn releases_for_anime(&self, anime_id: &str) -> Result<Vec<Release>>;

    /// All committed names of a release.
    fn names_for_release(&self, release_id: &str) -> Result<Vec<ReleaseName>>;

    /// Entity kinds this backend has a storage mapping for. Checked once at
    /// engine startup against the hook registry.
    fn mapped_kinds(&self) -> &[EntityKind];

    // =========================================================================
    // Transactional Commit
    // =========================================================================

    /// Apply every changeset entry plus the pre-commit repair actions in one
    /// transaction. Either everything commits or nothing does.
    fn apply_changeset(&self, changeset: &ChangeSet, repairs: &[RepairAction])
        -> Result<ApplyStats>;

    // =========================================================================
    // Post-Commit Bulk Primitives
    // =========================================================================
    // Each call runs in its own transactional scope, independent of the
    // commit that triggered it, and is idempotent.

    /// Delete company-map rows referencing any of the given releases.
    /// Returns the number of rows deleted.
    fn delete_company_maps_for_releases(&self, release_ids: &[String]) -> Result<usize>;

    /// Delete recommendation rows referencing any of the given anime, in
    /// either direction (as subject or as recommended target).
    fn delete_recommendations_for_anime(&self, anime_ids: &[String]) -> Result<usize>;

    /// Delete related-anime rows referencing any of the given anime, in
    /// either direction.
    fn delete_related_links_for_anime(&self, anime_ids: &[String]) -> Result<usize>;

    /// Delete company-map rows whose release no longer exists. Covers rows
    /// orphaned when the storage engine's own cascade removed a deleted
    /// anime's releases.
    fn delete_orphaned_company_maps(&self) -> Result<usize>;
}
