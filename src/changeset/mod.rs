//! Transaction-scoped change tracking.
//!
//! A `ChangeSet` is the ordered batch of entity mutations one transaction is
//! about to commit. It is created by a business operation, consumed exactly
//! once by the save engine, and has no existence outside that transaction.
//! Hooks read it through the inspector surface here; the committed side of
//! the picture comes from the catalog backend.

use crate::catalog_store::{
    Anime, AnimeRecommendation, CompanyReleaseMap, RelatedAnime, Release, ReleaseName,
    UserProgress,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// =============================================================================
// Enumerations
// =============================================================================

/// What a changeset entry does to its entity.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    /// Convert from database string representation
    pub fn from_db_str(s: &str) -> Self {
        match s {
            "added" => ChangeKind::Added,
            "modified" => ChangeKind::Modified,
            "deleted" => ChangeKind::Deleted,
            _ => ChangeKind::Modified, // Default fallback
        }
    }

    /// Convert to database string representation
    pub fn to_db_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        }
    }
}

/// Tag identifying which entity table a record belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Anime,
    Release,
    ReleaseName,
    CompanyReleaseMap,
    AnimeRecommendation,
    RelatedAnime,
    UserProgress,
}

impl EntityKind {
    pub fn from_db_str(s: &str) -> Self {
        match s {
            "anime" => EntityKind::Anime,
            "release" => EntityKind::Release,
            "release_name" => EntityKind::ReleaseName,
            "company_release_map" => EntityKind::CompanyReleaseMap,
            "anime_recommendation" => EntityKind::AnimeRecommendation,
            "related_anime" => EntityKind::RelatedAnime,
            "user_progress" => EntityKind::UserProgress,
            _ => EntityKind::Anime, // Default fallback
        }
    }

    pub fn to_db_str(&self) -> &'static str {
        match self {
            EntityKind::Anime => "anime",
            EntityKind::Release => "release",
            EntityKind::ReleaseName => "release_name",
            EntityKind::CompanyReleaseMap => "company_release_map",
            EntityKind::AnimeRecommendation => "anime_recommendation",
            EntityKind::RelatedAnime => "related_anime",
            EntityKind::UserProgress => "user_progress",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_str())
    }
}

// =============================================================================
// Records
// =============================================================================

/// A pending entity, tagged by kind so heterogeneous mutations can share one
/// changeset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityRecord {
    Anime(Anime),
    Release(Release),
    ReleaseName(ReleaseName),
    CompanyReleaseMap(CompanyReleaseMap),
    AnimeRecommendation(AnimeRecommendation),
    RelatedAnime(RelatedAnime),
    UserProgress(UserProgress),
}

impl EntityRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRecord::Anime(_) => EntityKind::Anime,
            EntityRecord::Release(_) => EntityKind::Release,
            EntityRecord::ReleaseName(_) => EntityKind::ReleaseName,
            EntityRecord::CompanyReleaseMap(_) => EntityKind::CompanyReleaseMap,
            EntityRecord::AnimeRecommendation(_) => EntityKind::AnimeRecommendation,
            EntityRecord::RelatedAnime(_) => EntityKind::RelatedAnime,
            EntityRecord::UserProgress(_) => EntityKind::UserProgress,
        }
    }

    /// Stable identity of the record. Join rows use their composite key.
    pub fn id(&self) -> String {
        match self {
            EntityRecord::Anime(a) => a.id.clone(),
            EntityRecord::Release(r) => r.id.clone(),
            EntityRecord::ReleaseName(n) => n.id.clone(),
            EntityRecord::CompanyReleaseMap(m) => format!("{}/{}", m.company_id, m.release_id),
            EntityRecord::AnimeRecommendation(m) => format!("{}/{}", m.anime_id, m.recommended_id),
            EntityRecord::RelatedAnime(m) => format!("{}/{}", m.anime_id, m.related_id),
            EntityRecord::UserProgress(p) => format!("{}/{}", p.user_id, p.anime_id),
        }
    }
}

/// One pending mutation.
///
/// `prior` holds the pre-mutation field values and is populated only for
/// `Modified` entries; transition rules (episode-count decrease) need it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeSetEntry {
    pub entity: EntityRecord,
    pub kind: ChangeKind,
    pub prior: Option<EntityRecord>,
}

// =============================================================================
// ChangeSet
// =============================================================================

/// The set of mutations accumulated in one not-yet-committed transaction.
#[derive(Clone, Debug)]
pub struct ChangeSet {
    id: String,
    entries: Vec<ChangeSetEntry>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entries: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a newly created entity.
    pub fn add(&mut self, entity: EntityRecord) {
        self.entries.push(ChangeSetEntry {
            entity,
            kind: ChangeKind::Added,
            prior: None,
        });
    }

    /// Record an update. `prior` must be the pre-mutation state of the same
    /// entity.
    pub fn update(&mut self, entity: EntityRecord, prior: EntityRecord) {
        debug_assert_eq!(entity.kind(), prior.kind());
        debug_assert_eq!(entity.id(), prior.id());
        self.entries.push(ChangeSetEntry {
            entity,
            kind: ChangeKind::Modified,
            prior: Some(prior),
        });
    }

    /// Record a deletion. `entity` is the current state of the row being
    /// removed.
    pub fn delete(&mut self, entity: EntityRecord) {
        self.entries.push(ChangeSetEntry {
            entity,
            kind: ChangeKind::Deleted,
            prior: None,
        });
    }

    pub fn entries(&self) -> &[ChangeSetEntry] {
        &self.entries
    }

    /// All pending entries for one entity type, in insertion order.
    pub fn entries_of(&self, kind: EntityKind) -> impl Iterator<Item = &ChangeSetEntry> {
        self.entries.iter().filter(move |e| e.entity.kind() == kind)
    }

    /// Entity kinds with at least one pending entry, in first-seen order.
    pub fn kinds_present(&self) -> Vec<EntityKind> {
        let mut kinds = Vec::new();
        for entry in &self.entries {
            let kind = entry.entity.kind();
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        kinds
    }

    /// Latest pending entry for an entity, if any. When the same entity was
    /// touched more than once in the batch, the last entry wins; it models
    /// what the transaction is about to produce.
    pub fn pending(&self, kind: EntityKind, id: &str) -> Option<&ChangeSetEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.entity.kind() == kind && e.entity.id() == id)
    }

    /// True when the latest pending entry for the entity is a deletion.
    pub fn is_pending_deleted(&self, kind: EntityKind, id: &str) -> bool {
        matches!(
            self.pending(kind, id),
            Some(entry) if entry.kind == ChangeKind::Deleted
        )
    }
}

impl Default for ChangeSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog_store::AnimeKind;

    fn make_anime(id: &str) -> EntityRecord {
        EntityRecord::Anime(Anime {
            id: id.to_string(),
            title: format!("Anime {}", id),
            kind: AnimeKind::Tv,
            synopsis: None,
            start_year: Some(2021),
        })
    }

    fn make_release(id: &str, anime_id: &str, is_primary: bool) -> EntityRecord {
        EntityRecord::Release(Release {
            id: id.to_string(),
            anime_id: anime_id.to_string(),
            is_primary,
            language: "ja".to_string(),
            episode_count: Some(12),
            notes: None,
        })
    }

    #[test]
    fn test_entries_of_filters_by_kind() {
        let mut cs = ChangeSet::new();
        cs.add(make_anime("a1"));
        cs.add(make_release("r1", "a1", true));
        cs.add(make_release("r2", "a1", false));

        assert_eq!(cs.entries_of(EntityKind::Release).count(), 2);
        assert_eq!(cs.entries_of(EntityKind::Anime).count(), 1);
        assert_eq!(cs.entries_of(EntityKind::UserProgress).count(), 0);
    }

    #[test]
    fn test_kinds_present_dedups_in_first_seen_order() {
        let mut cs = ChangeSet::new();
        cs.add(make_release("r1", "a1", true));
        cs.add(make_anime("a1"));
        cs.add(make_release("r2", "a1", false));

        assert_eq!(
            cs.kinds_present(),
            vec![EntityKind::Release, EntityKind::Anime]
        );
    }

    #[test]
    fn test_latest_pending_entry_wins() {
        let mut cs = ChangeSet::new();
        let first = make_release("r1", "a1", false);
        let second = make_release("r1", "a1", true);
        cs.add(first.clone());
        cs.update(second, first);

        let entry = cs.pending(EntityKind::Release, "r1").unwrap();
        assert_eq!(entry.kind, ChangeKind::Modified);
        match &entry.entity {
            EntityRecord::Release(r) => assert!(r.is_primary),
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_is_pending_deleted_tracks_last_entry() {
        let mut cs = ChangeSet::new();
        let release = make_release("r1", "a1", true);
        cs.add(release.clone());
        assert!(!cs.is_pending_deleted(EntityKind::Release, "r1"));

        cs.delete(release);
        assert!(cs.is_pending_deleted(EntityKind::Release, "r1"));
    }

    #[test]
    fn test_join_rows_use_composite_ids() {
        let rec = EntityRecord::AnimeRecommendation(AnimeRecommendation {
            anime_id: "a1".to_string(),
            recommended_id: "a2".to_string(),
        });
        assert_eq!(rec.id(), "a1/a2");
        assert_eq!(rec.kind(), EntityKind::AnimeRecommendation);
    }
}
