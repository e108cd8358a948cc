//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use anikura_catalog::catalog_store::{
    Anime, AnimeKind, AnimeRecommendation, RelatedAnime, RelationKind, Release, ReleaseName,
    SqliteCatalogStore, UserProgress,
};
use anikura_catalog::save::SaveEngine;
use anikura_catalog::{ChangeSet, EntityRecord};
use std::sync::Arc;
use tempfile::TempDir;

/// A file-backed catalog plus an engine over it. The tempdir must outlive
/// the store, so it rides along.
pub struct TestCatalog {
    pub store: Arc<SqliteCatalogStore>,
    pub engine: SaveEngine<SqliteCatalogStore>,
    _dir: TempDir,
}

pub fn catalog() -> TestCatalog {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteCatalogStore::new(dir.path().join("catalog.db"), 2).unwrap());
    let engine = SaveEngine::new(store.clone()).unwrap();
    TestCatalog {
        store,
        engine,
        _dir: dir,
    }
}

pub fn make_anime(id: &str) -> Anime {
    Anime {
        id: id.to_string(),
        title: format!("Anime {}", id),
        kind: AnimeKind::Tv,
        synopsis: None,
        start_year: Some(2018),
    }
}

pub fn make_release(id: &str, anime_id: &str, is_primary: bool, episode_count: Option<i32>) -> Release {
    Release {
        id: id.to_string(),
        anime_id: anime_id.to_string(),
        is_primary,
        language: "ja".to_string(),
        episode_count,
        notes: None,
    }
}

pub fn make_name(id: &str, release_id: &str, is_primary: bool) -> ReleaseName {
    ReleaseName {
        id: id.to_string(),
        release_id: release_id.to_string(),
        name: format!("Name {}", id),
        is_primary,
        script: None,
    }
}

pub fn make_progress(user_id: &str, anime_id: &str, episodes_seen: i32) -> UserProgress {
    UserProgress {
        user_id: user_id.to_string(),
        anime_id: anime_id.to_string(),
        episodes_seen,
    }
}

pub fn make_recommendation(anime_id: &str, recommended_id: &str) -> AnimeRecommendation {
    AnimeRecommendation {
        anime_id: anime_id.to_string(),
        recommended_id: recommended_id.to_string(),
    }
}

pub fn make_related(anime_id: &str, related_id: &str) -> RelatedAnime {
    RelatedAnime {
        anime_id: anime_id.to_string(),
        related_id: related_id.to_string(),
        relation: RelationKind::Sequel,
    }
}

/// Commit an anime with the given releases through the engine. Each release
/// gets one primary name ("<release id>-name").
pub fn seed_anime(cat: &TestCatalog, anime_id: &str, releases: &[(&str, bool, Option<i32>)]) {
    let mut cs = ChangeSet::new();
    cs.add(EntityRecord::Anime(make_anime(anime_id)));
    for (release_id, is_primary, episode_count) in releases {
        cs.add(EntityRecord::Release(make_release(
            release_id,
            anime_id,
            *is_primary,
            *episode_count,
        )));
        cs.add(EntityRecord::ReleaseName(make_name(
            &format!("{}-name", release_id),
            release_id,
            true,
        )));
    }
    cat.engine.save(cs).unwrap();
}
