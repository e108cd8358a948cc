//! Domain models for the anime catalog.
//!
//! An `Anime` owns one or more `Release` rows (the distinct published
//! editions of a show); each `Release` owns one or more `ReleaseName` rows.
//! Exactly one release per anime and one name per release carry the primary
//! flag. The map types are many-to-many join rows between these entities.

use crate::changeset::{ChangeKind, EntityKind};
use serde::{Deserialize, Serialize};

// =============================================================================
// Enumerations
// =============================================================================

/// Broadcast format of an anime.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum AnimeKind {
    Tv,
    Movie,
    Ova,
    Web,
    Special,
}

impl AnimeKind {
    /// Convert from database string representation
    pub fn from_db_str(s: &str) -> Self {
        match s {
            "tv" => AnimeKind::Tv,
            "movie" => AnimeKind::Movie,
            "ova" => AnimeKind::Ova,
            "web" => AnimeKind::Web,
            "special" => AnimeKind::Special,
            _ => AnimeKind::Tv, // Default fallback
        }
    }

    /// Convert to database string representation
    pub fn to_db_str(&self) -> &'static str {
        match self {
            AnimeKind::Tv => "tv",
            AnimeKind::Movie => "movie",
            AnimeKind::Ova => "ova",
            AnimeKind::Web => "web",
            AnimeKind::Special => "special",
        }
    }
}

/// Role a company plays for a release.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CompanyRole {
    Publisher,
    Translator,
    Producer,
}

impl CompanyRole {
    pub fn from_db_str(s: &str) -> Self {
        match s {
            "publisher" => CompanyRole::Publisher,
            "translator" => CompanyRole::Translator,
            "producer" => CompanyRole::Producer,
            _ => CompanyRole::Publisher, // Default fallback
        }
    }

    pub fn to_db_str(&self) -> &'static str {
        match self {
            CompanyRole::Publisher => "publisher",
            CompanyRole::Translator => "translator",
            CompanyRole::Producer => "producer",
        }
    }
}

/// How two anime relate to each other.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RelationKind {
    Sequel,
    Prequel,
    SideStory,
    Summary,
    Other,
}

impl RelationKind {
    pub fn from_db_str(s: &str) -> Self {
        match s {
            "sequel" => RelationKind::Sequel,
            "prequel" => RelationKind::Prequel,
            "side_story" => RelationKind::SideStory,
            "summary" => RelationKind::Summary,
            _ => RelationKind::Other,
        }
    }

    pub fn to_db_str(&self) -> &'static str {
        match self {
            RelationKind::Sequel => "sequel",
            RelationKind::Prequel => "prequel",
            RelationKind::SideStory => "side_story",
            RelationKind::Summary => "summary",
            RelationKind::Other => "other",
        }
    }
}

// =============================================================================
// Entities
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Anime {
    pub id: String,
    pub title: String,
    pub kind: AnimeKind,
    pub synopsis: Option<String>,
    pub start_year: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: String,
    pub anime_id: String,
    /// Exactly one release per non-deleted anime carries this flag.
    pub is_primary: bool,
    /// ISO 639-1 language code of the release.
    pub language: String,
    pub episode_count: Option<i32>,
    pub notes: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReleaseName {
    pub id: String,
    pub release_id: String,
    pub name: String,
    /// Exactly one name per non-deleted release carries this flag.
    pub is_primary: bool,
    /// ISO 15924 script code, when the name is not in Latin script.
    pub script: Option<String>,
}

/// Company <-> Release join row. Keyed by (company_id, release_id).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompanyReleaseMap {
    pub company_id: String,
    pub release_id: String,
    pub role: CompanyRole,
}

/// Recommendation join row. Keyed by (anime_id, recommended_id).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnimeRecommendation {
    pub anime_id: String,
    pub recommended_id: String,
}

/// Related-anime join row. Keyed by (anime_id, related_id).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelatedAnime {
    pub anime_id: String,
    pub related_id: String,
    pub relation: RelationKind,
}

/// Per-user watch progress for an anime. Keyed by (user_id, anime_id).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserProgress {
    pub user_id: String,
    pub anime_id: String,
    pub episodes_seen: i32,
}

// =============================================================================
// Change history
// =============================================================================

/// A committed mutation recorded in the `change_log` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    /// Auto-incrementing ID
    pub id: i64,
    /// ID of the changeset this mutation was committed in
    pub changeset_id: String,
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub operation: ChangeKind,
    /// Full JSON snapshot of the entity after the change (before for deletes)
    pub entity_snapshot: serde_json::Value,
    /// Unix timestamp when the change was committed
    pub created_at: i64,
}
