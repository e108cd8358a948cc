//! Business invariants evaluated before a changeset commits.
//!
//! Validators are pure: they read the pending changeset and the committed
//! view, produce violations, and never mutate state. Every rule resolves
//! sibling rows through the effective overlay, so a pending change to one
//! row is visible while its siblings are still being judged.

use super::hooks::{HookContext, RepairAction};
use crate::catalog_store::Release;
use crate::changeset::{ChangeKind, EntityKind, EntityRecord};
use anyhow::Result;
use serde::Serialize;
use std::fmt;

/// A business-rule violation. Returned to the caller when the transaction is
/// aborted; the message is user-facing.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub enum Violation {
    AnimeWithoutRelease {
        anime_id: String,
    },
    PrimaryReleaseDeleted {
        anime_id: String,
        release_id: String,
    },
    PrimaryReleaseCount {
        anime_id: String,
        primary_count: usize,
    },
    PrimaryNameCount {
        release_id: String,
        primary_count: usize,
    },
}

impl Violation {
    /// The field the violation points at, when it has one.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Violation::AnimeWithoutRelease { .. } => None,
            Violation::PrimaryReleaseDeleted { .. }
            | Violation::PrimaryReleaseCount { .. }
            | Violation::PrimaryNameCount { .. } => Some("is_primary"),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::AnimeWithoutRelease { anime_id } => {
                write!(f, "Anime '{}' left without a release", anime_id)
            }
            Violation::PrimaryReleaseDeleted {
                anime_id,
                release_id,
            } => write!(
                f,
                "Primary release '{}' of anime '{}' deleted without a replacement",
                release_id, anime_id
            ),
            Violation::PrimaryReleaseCount {
                anime_id,
                primary_count,
            } => write!(
                f,
                "Exactly one release of anime '{}' must be primary, found {}",
                anime_id, primary_count
            ),
            Violation::PrimaryNameCount {
                release_id,
                primary_count,
            } => write!(
                f,
                "Exactly one name of release '{}' must be primary, found {}",
                release_id, primary_count
            ),
        }
    }
}

fn push_unique(ids: &mut Vec<String>, id: &str) {
    if !ids.iter().any(|existing| existing == id) {
        ids.push(id.to_string());
    }
}

/// Anime ids touched by pending release entries, through both the entry's
/// current parent and (for re-parented rows) its prior parent.
fn anime_touched_by_releases(ctx: &HookContext) -> Vec<String> {
    let mut ids = Vec::new();
    for entry in ctx.changeset.entries_of(EntityKind::Release) {
        if let EntityRecord::Release(release) = &entry.entity {
            push_unique(&mut ids, &release.anime_id);
        }
        if let Some(EntityRecord::Release(prior)) = &entry.prior {
            push_unique(&mut ids, &prior.anime_id);
        }
    }
    ids
}

/// Release-level invariants for every anime touched by pending release
/// changes: an anime that survives the transaction keeps at least one
/// release and exactly one primary among the survivors, and the names of
/// every changed, surviving release keep exactly one primary.
pub fn validate_release_changes(ctx: &HookContext) -> Result<Vec<Violation>> {
    let mut violations = Vec::new();

    for anime_id in anime_touched_by_releases(ctx) {
        if ctx.is_effectively_deleted(EntityKind::Anime, &anime_id)? {
            // Invariants are vacuous for an anime dying in this transaction.
            continue;
        }

        let releases = ctx.effective_releases(&anime_id)?;
        let remaining: Vec<&Release> = releases
            .iter()
            .filter(|r| !r.deleted)
            .map(|r| &r.row)
            .collect();

        if remaining.is_empty() {
            violations.push(Violation::AnimeWithoutRelease { anime_id });
            continue;
        }

        let primary_count = remaining.iter().filter(|r| r.is_primary).count();
        if primary_count == 0 {
            // Prefer the specific message when the old primary was deleted
            // in this very changeset.
            let deleted_primary = releases.iter().find(|r| {
                r.deleted
                    && r.row.is_primary
                    && ctx
                        .changeset
                        .is_pending_deleted(EntityKind::Release, &r.row.id)
            });
            match deleted_primary {
                Some(dp) => violations.push(Violation::PrimaryReleaseDeleted {
                    anime_id: anime_id.clone(),
                    release_id: dp.row.id.clone(),
                }),
                None => violations.push(Violation::PrimaryReleaseCount {
                    anime_id: anime_id.clone(),
                    primary_count,
                }),
            }
        } else if primary_count != 1 {
            violations.push(Violation::PrimaryReleaseCount {
                anime_id: anime_id.clone(),
                primary_count,
            });
        }

        // Name sub-invariant for releases changed in this batch that survive.
        let mut checked: Vec<String> = Vec::new();
        for entry in ctx.changeset.entries_of(EntityKind::Release) {
            let EntityRecord::Release(release) = &entry.entity else {
                continue;
            };
            if release.anime_id != anime_id || checked.contains(&release.id) {
                continue;
            }
            checked.push(release.id.clone());
            if ctx
                .changeset
                .is_pending_deleted(EntityKind::Release, &release.id)
            {
                continue;
            }
            violations.extend(validate_names_of(ctx, &release.id)?);
        }
    }
    Ok(violations)
}

/// Invariant: among a release's effective names, exactly one is primary.
fn validate_names_of(ctx: &HookContext, release_id: &str) -> Result<Vec<Violation>> {
    let names = ctx.effective_names(release_id)?;
    let primary_count = names
        .iter()
        .filter(|n| !n.deleted && n.row.is_primary)
        .count();
    if primary_count != 1 {
        return Ok(vec![Violation::PrimaryNameCount {
            release_id: release_id.to_string(),
            primary_count,
        }]);
    }
    Ok(Vec::new())
}

/// Name invariant for releases touched by pending name changes.
pub fn validate_name_changes(ctx: &HookContext) -> Result<Vec<Violation>> {
    let mut release_ids = Vec::new();
    for entry in ctx.changeset.entries_of(EntityKind::ReleaseName) {
        if let EntityRecord::ReleaseName(name) = &entry.entity {
            push_unique(&mut release_ids, &name.release_id);
        }
        if let Some(EntityRecord::ReleaseName(prior)) = &entry.prior {
            push_unique(&mut release_ids, &prior.release_id);
        }
    }

    let mut violations = Vec::new();
    for release_id in release_ids {
        if ctx.is_effectively_deleted(EntityKind::Release, &release_id)? {
            continue;
        }
        violations.extend(validate_names_of(ctx, &release_id)?);
    }
    Ok(violations)
}

/// An anime that is added or modified (not deleted) must end the transaction
/// with at least one surviving release.
pub fn validate_anime_release_presence(ctx: &HookContext) -> Result<Vec<Violation>> {
    let mut violations = Vec::new();
    let mut seen: Vec<String> = Vec::new();

    for entry in ctx.changeset.entries_of(EntityKind::Anime) {
        let EntityRecord::Anime(anime) = &entry.entity else {
            continue;
        };
        if seen.contains(&anime.id) {
            continue;
        }
        seen.push(anime.id.clone());
        if ctx
            .changeset
            .is_pending_deleted(EntityKind::Anime, &anime.id)
        {
            continue;
        }
        let releases = ctx.effective_releases(&anime.id)?;
        if releases.iter().all(|r| r.deleted) {
            violations.push(Violation::AnimeWithoutRelease {
                anime_id: anime.id.clone(),
            });
        }
    }
    Ok(violations)
}

/// Transition rule: when a primary release's episode count strictly
/// decreases, user progress beyond the new count must be clamped down to it,
/// inside the same transaction as the edit.
pub fn collect_progress_clamps(ctx: &HookContext) -> Result<Vec<RepairAction>> {
    let mut repairs = Vec::new();
    for entry in ctx.changeset.entries_of(EntityKind::Release) {
        if entry.kind != ChangeKind::Modified {
            continue;
        }
        let EntityRecord::Release(release) = &entry.entity else {
            continue;
        };
        let Some(EntityRecord::Release(prior)) = &entry.prior else {
            continue;
        };
        if !release.is_primary {
            continue;
        }
        let (Some(old_count), Some(new_count)) = (prior.episode_count, release.episode_count)
        else {
            continue;
        };
        if new_count >= old_count {
            continue;
        }
        let repair = RepairAction::ClampEpisodeProgress {
            anime_id: release.anime_id.clone(),
            episode_cap: new_count,
        };
        if !repairs.contains(&repair) {
            repairs.push(repair);
        }
    }
    Ok(repairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog_store::{
        Anime, AnimeKind, CatalogBackend, ReleaseName, SqliteCatalogStore,
    };
    use crate::changeset::ChangeSet;

    fn make_anime(id: &str) -> Anime {
        Anime {
            id: id.to_string(),
            title: format!("Anime {}", id),
            kind: AnimeKind::Tv,
            synopsis: None,
            start_year: Some(2019),
        }
    }

    fn make_release(id: &str, anime_id: &str, is_primary: bool) -> Release {
        Release {
            id: id.to_string(),
            anime_id: anime_id.to_string(),
            is_primary,
            language: "ja".to_string(),
            episode_count: Some(24),
            notes: None,
        }
    }

    fn make_name(id: &str, release_id: &str, is_primary: bool) -> ReleaseName {
        ReleaseName {
            id: id.to_string(),
            release_id: release_id.to_string(),
            name: format!("Name {}", id),
            is_primary,
            script: None,
        }
    }

    /// Committed baseline: anime a1 with primary release r1 (one primary
    /// name n1) and secondary release r2 (one primary name n2).
    fn seeded_store() -> SqliteCatalogStore {
        let store = SqliteCatalogStore::new_in_memory().unwrap();
        let mut cs = ChangeSet::new();
        cs.add(EntityRecord::Anime(make_anime("a1")));
        cs.add(EntityRecord::Release(make_release("r1", "a1", true)));
        cs.add(EntityRecord::Release(make_release("r2", "a1", false)));
        cs.add(EntityRecord::ReleaseName(make_name("n1", "r1", true)));
        cs.add(EntityRecord::ReleaseName(make_name("n2", "r2", true)));
        store.apply_changeset(&cs, &[]).unwrap();
        store
    }

    #[test]
    fn test_deleting_sole_release_violates_presence() {
        let store = SqliteCatalogStore::new_in_memory().unwrap();
        let mut seed = ChangeSet::new();
        seed.add(EntityRecord::Anime(make_anime("a1")));
        seed.add(EntityRecord::Release(make_release("r1", "a1", true)));
        store.apply_changeset(&seed, &[]).unwrap();

        let mut cs = ChangeSet::new();
        cs.delete(EntityRecord::Release(make_release("r1", "a1", true)));
        let ctx = HookContext {
            changeset: &cs,
            backend: &store,
        };
        let violations = validate_release_changes(&ctx).unwrap();
        assert_eq!(
            violations,
            vec![Violation::AnimeWithoutRelease {
                anime_id: "a1".to_string()
            }]
        );
    }

    #[test]
    fn test_deleting_sole_release_with_anime_is_clean() {
        let store = SqliteCatalogStore::new_in_memory().unwrap();
        let mut seed = ChangeSet::new();
        seed.add(EntityRecord::Anime(make_anime("a1")));
        seed.add(EntityRecord::Release(make_release("r1", "a1", true)));
        store.apply_changeset(&seed, &[]).unwrap();

        let mut cs = ChangeSet::new();
        cs.delete(EntityRecord::Release(make_release("r1", "a1", true)));
        cs.delete(EntityRecord::Anime(make_anime("a1")));
        let ctx = HookContext {
            changeset: &cs,
            backend: &store,
        };
        assert!(validate_release_changes(&ctx).unwrap().is_empty());
    }

    #[test]
    fn test_deleting_primary_without_replacement() {
        let store = seeded_store();
        let mut cs = ChangeSet::new();
        cs.delete(EntityRecord::Release(make_release("r1", "a1", true)));
        let ctx = HookContext {
            changeset: &cs,
            backend: &store,
        };
        let violations = validate_release_changes(&ctx).unwrap();
        assert_eq!(
            violations,
            vec![Violation::PrimaryReleaseDeleted {
                anime_id: "a1".to_string(),
                release_id: "r1".to_string()
            }]
        );
    }

    #[test]
    fn test_deleting_primary_with_concurrent_replacement_is_clean() {
        let store = seeded_store();
        let mut cs = ChangeSet::new();
        cs.delete(EntityRecord::Release(make_release("r1", "a1", true)));
        cs.update(
            EntityRecord::Release(make_release("r2", "a1", true)),
            EntityRecord::Release(make_release("r2", "a1", false)),
        );
        let ctx = HookContext {
            changeset: &cs,
            backend: &store,
        };
        assert!(validate_release_changes(&ctx).unwrap().is_empty());
    }

    #[test]
    fn test_second_primary_release_is_rejected() {
        let store = seeded_store();
        let mut cs = ChangeSet::new();
        cs.update(
            EntityRecord::Release(make_release("r2", "a1", true)),
            EntityRecord::Release(make_release("r2", "a1", false)),
        );
        let ctx = HookContext {
            changeset: &cs,
            backend: &store,
        };
        let violations = validate_release_changes(&ctx).unwrap();
        assert_eq!(
            violations,
            vec![Violation::PrimaryReleaseCount {
                anime_id: "a1".to_string(),
                primary_count: 2
            }]
        );
    }

    #[test]
    fn test_added_release_without_primary_name() {
        let store = seeded_store();
        let mut cs = ChangeSet::new();
        cs.add(EntityRecord::Release(make_release("r3", "a1", false)));
        let ctx = HookContext {
            changeset: &cs,
            backend: &store,
        };
        let violations = validate_release_changes(&ctx).unwrap();
        assert_eq!(
            violations,
            vec![Violation::PrimaryNameCount {
                release_id: "r3".to_string(),
                primary_count: 0
            }]
        );
    }

    #[test]
    fn test_second_primary_name_is_rejected() {
        let store = seeded_store();
        let mut cs = ChangeSet::new();
        cs.add(EntityRecord::ReleaseName(make_name("n3", "r1", true)));
        let ctx = HookContext {
            changeset: &cs,
            backend: &store,
        };
        let violations = validate_name_changes(&ctx).unwrap();
        assert_eq!(
            violations,
            vec![Violation::PrimaryNameCount {
                release_id: "r1".to_string(),
                primary_count: 2
            }]
        );
    }

    #[test]
    fn test_name_changes_on_deleted_release_are_ignored() {
        let store = seeded_store();
        let mut cs = ChangeSet::new();
        cs.delete(EntityRecord::Release(make_release("r2", "a1", false)));
        cs.delete(EntityRecord::ReleaseName(make_name("n2", "r2", true)));
        let ctx = HookContext {
            changeset: &cs,
            backend: &store,
        };
        assert!(validate_name_changes(&ctx).unwrap().is_empty());
    }

    #[test]
    fn test_added_anime_without_release_is_rejected() {
        let store = SqliteCatalogStore::new_in_memory().unwrap();
        let mut cs = ChangeSet::new();
        cs.add(EntityRecord::Anime(make_anime("a9")));
        let ctx = HookContext {
            changeset: &cs,
            backend: &store,
        };
        let violations = validate_anime_release_presence(&ctx).unwrap();
        assert_eq!(
            violations,
            vec![Violation::AnimeWithoutRelease {
                anime_id: "a9".to_string()
            }]
        );
    }

    #[test]
    fn test_added_anime_with_release_in_same_changeset_is_clean() {
        let store = SqliteCatalogStore::new_in_memory().unwrap();
        let mut cs = ChangeSet::new();
        cs.add(EntityRecord::Anime(make_anime("a9")));
        cs.add(EntityRecord::Release(make_release("r9", "a9", true)));
        let ctx = HookContext {
            changeset: &cs,
            backend: &store,
        };
        assert!(validate_anime_release_presence(&ctx).unwrap().is_empty());
    }

    #[test]
    fn test_reparenting_validates_old_parent_too() {
        let store = seeded_store();
        let mut second = ChangeSet::new();
        second.add(EntityRecord::Anime(make_anime("a2")));
        second.add(EntityRecord::Release(make_release("r4", "a2", true)));
        store.apply_changeset(&second, &[]).unwrap();

        // Move a2's only release over to a1.
        let mut cs = ChangeSet::new();
        cs.update(
            EntityRecord::Release(make_release("r4", "a1", false)),
            EntityRecord::Release(make_release("r4", "a2", true)),
        );
        let ctx = HookContext {
            changeset: &cs,
            backend: &store,
        };
        let violations = validate_release_changes(&ctx).unwrap();
        assert!(violations.contains(&Violation::AnimeWithoutRelease {
            anime_id: "a2".to_string()
        }));
    }

    #[test]
    fn test_clamp_collected_on_primary_episode_decrease() {
        let store = seeded_store();
        let mut cs = ChangeSet::new();
        let mut shrunk = make_release("r1", "a1", true);
        shrunk.episode_count = Some(20);
        cs.update(
            EntityRecord::Release(shrunk),
            EntityRecord::Release(make_release("r1", "a1", true)),
        );
        let ctx = HookContext {
            changeset: &cs,
            backend: &store,
        };
        let repairs = collect_progress_clamps(&ctx).unwrap();
        assert_eq!(
            repairs,
            vec![RepairAction::ClampEpisodeProgress {
                anime_id: "a1".to_string(),
                episode_cap: 20
            }]
        );
    }

    #[test]
    fn test_no_clamp_on_increase_or_secondary_release() {
        let store = seeded_store();

        let mut grow = ChangeSet::new();
        let mut grown = make_release("r1", "a1", true);
        grown.episode_count = Some(26);
        grow.update(
            EntityRecord::Release(grown),
            EntityRecord::Release(make_release("r1", "a1", true)),
        );
        let ctx = HookContext {
            changeset: &grow,
            backend: &store,
        };
        assert!(collect_progress_clamps(&ctx).unwrap().is_empty());

        let mut secondary = ChangeSet::new();
        let mut shrunk = make_release("r2", "a1", false);
        shrunk.episode_count = Some(2);
        secondary.update(
            EntityRecord::Release(shrunk),
            EntityRecord::Release(make_release("r2", "a1", false)),
        );
        let ctx = HookContext {
            changeset: &secondary,
            backend: &store,
        };
        assert!(collect_progress_clamps(&ctx).unwrap().is_empty());
    }
}
