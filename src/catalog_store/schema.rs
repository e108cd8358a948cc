//! SQLite schema for the anime catalog database.
//!
//! Entity tables use text ids as primary keys. The hierarchy
//! anime -> releases -> release_names (and anime -> user_progress) is wired
//! into the storage engine's own foreign-key cascade. The three join tables
//! are deliberately not: they are cleaned up by the save engine's post-commit
//! cascades, which must stay correct whether or not the storage engine
//! handles them.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP,
};
use anyhow::Result;
use rusqlite::Connection;

// =============================================================================
// Core Tables
// =============================================================================

const ANIME_TABLE: Table = Table {
    name: "anime",
    columns: &[
        sqlite_column!("id", SqlType::Text, is_primary_key = true),
        sqlite_column!("title", SqlType::Text, non_null = true),
        sqlite_column!("kind", SqlType::Text, non_null = true), // 'tv', 'movie', 'ova', 'web', 'special'
        sqlite_column!("synopsis", SqlType::Text),
        sqlite_column!("start_year", SqlType::Integer),
    ],
    indices: &[("idx_anime_title", "title")],
    unique_constraints: &[],
};

const RELEASES_ANIME_FK: ForeignKey = ForeignKey {
    foreign_table: "anime",
    foreign_column: "id",
    on_delete: ForeignKeyOnChange::Cascade,
};

const RELEASES_TABLE_V0: Table = Table {
    name: "releases",
    columns: &[
        sqlite_column!("id", SqlType::Text, is_primary_key = true),
        sqlite_column!(
            "anime_id",
            SqlType::Text,
            non_null = true,
            foreign_key = Some(&RELEASES_ANIME_FK)
        ),
        sqlite_column!("is_primary", SqlType::Integer, non_null = true),
        sqlite_column!("language", SqlType::Text, non_null = true), // ISO 639-1
        sqlite_column!("episode_count", SqlType::Integer),
    ],
    indices: &[("idx_releases_anime", "anime_id")],
    unique_constraints: &[],
};

/// v1 adds free-form editorial notes to releases.
const RELEASES_TABLE: Table = Table {
    name: "releases",
    columns: &[
        sqlite_column!("id", SqlType::Text, is_primary_key = true),
        sqlite_column!(
            "anime_id",
            SqlType::Text,
            non_null = true,
            foreign_key = Some(&RELEASES_ANIME_FK)
        ),
        sqlite_column!("is_primary", SqlType::Integer, non_null = true),
        sqlite_column!("language", SqlType::Text, non_null = true),
        sqlite_column!("episode_count", SqlType::Integer),
        sqlite_column!("notes", SqlType::Text),
    ],
    indices: &[("idx_releases_anime", "anime_id")],
    unique_constraints: &[],
};

const RELEASE_NAMES_RELEASE_FK: ForeignKey = ForeignKey {
    foreign_table: "releases",
    foreign_column: "id",
    on_delete: ForeignKeyOnChange::Cascade,
};

const RELEASE_NAMES_TABLE: Table = Table {
    name: "release_names",
    columns: &[
        sqlite_column!("id", SqlType::Text, is_primary_key = true),
        sqlite_column!(
            "release_id",
            SqlType::Text,
            non_null = true,
            foreign_key = Some(&RELEASE_NAMES_RELEASE_FK)
        ),
        sqlite_column!("name", SqlType::Text, non_null = true),
        sqlite_column!("is_primary", SqlType::Integer, non_null = true),
        sqlite_column!("script", SqlType::Text), // ISO 15924
    ],
    indices: &[("idx_release_names_release", "release_id")],
    unique_constraints: &[],
};

const USER_PROGRESS_ANIME_FK: ForeignKey = ForeignKey {
    foreign_table: "anime",
    foreign_column: "id",
    on_delete: ForeignKeyOnChange::Cascade,
};

const USER_PROGRESS_TABLE: Table = Table {
    name: "user_progress",
    columns: &[
        sqlite_column!("user_id", SqlType::Text, non_null = true),
        sqlite_column!(
            "anime_id",
            SqlType::Text,
            non_null = true,
            foreign_key = Some(&USER_PROGRESS_ANIME_FK)
        ),
        sqlite_column!("episodes_seen", SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_user_progress_anime", "anime_id")],
    unique_constraints: &[&["user_id", "anime_id"]],
};

// =============================================================================
// Junction Tables (no FK cascade; engine-cleaned)
// =============================================================================

const COMPANY_RELEASE_MAP_TABLE: Table = Table {
    name: "company_release_map",
    columns: &[
        sqlite_column!("company_id", SqlType::Text, non_null = true),
        sqlite_column!("release_id", SqlType::Text, non_null = true),
        sqlite_column!("role", SqlType::Text, non_null = true), // 'publisher', 'translator', 'producer'
    ],
    indices: &[("idx_company_release_map_release", "release_id")],
    unique_constraints: &[&["company_id", "release_id"]],
};

const ANIME_RECOMMENDATIONS_TABLE: Table = Table {
    name: "anime_recommendations",
    columns: &[
        sqlite_column!("anime_id", SqlType::Text, non_null = true),
        sqlite_column!("recommended_id", SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_anime_recommendations_anime", "anime_id"),
        ("idx_anime_recommendations_target", "recommended_id"),
    ],
    unique_constraints: &[&["anime_id", "recommended_id"]],
};

const RELATED_ANIME_TABLE: Table = Table {
    name: "related_anime",
    columns: &[
        sqlite_column!("anime_id", SqlType::Text, non_null = true),
        sqlite_column!("related_id", SqlType::Text, non_null = true),
        sqlite_column!("relation", SqlType::Text, non_null = true), // 'sequel', 'prequel', 'side_story', 'summary', 'other'
    ],
    indices: &[
        ("idx_related_anime_anime", "anime_id"),
        ("idx_related_anime_target", "related_id"),
    ],
    unique_constraints: &[&["anime_id", "related_id"]],
};

// =============================================================================
// Change History
// =============================================================================

const CHANGE_LOG_TABLE: Table = Table {
    name: "change_log",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("changeset_id", SqlType::Text, non_null = true),
        sqlite_column!("entity_type", SqlType::Text, non_null = true),
        sqlite_column!("entity_id", SqlType::Text, non_null = true),
        sqlite_column!("operation", SqlType::Text, non_null = true), // 'added', 'modified', 'deleted'
        sqlite_column!("entity_snapshot", SqlType::Text, non_null = true),
        sqlite_column!(
            "created_at",
            SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[("idx_change_log_entity", "entity_id")],
    unique_constraints: &[],
};

// =============================================================================
// Versioned Schemas
// =============================================================================

fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
    conn.execute("ALTER TABLE releases ADD COLUMN notes TEXT", [])?;
    Ok(())
}

pub const CATALOG_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 0,
        tables: &[
            ANIME_TABLE,
            RELEASES_TABLE_V0,
            RELEASE_NAMES_TABLE,
            USER_PROGRESS_TABLE,
            COMPANY_RELEASE_MAP_TABLE,
            ANIME_RECOMMENDATIONS_TABLE,
            RELATED_ANIME_TABLE,
            CHANGE_LOG_TABLE,
        ],
        migration: None,
    },
    VersionedSchema {
        version: 1,
        tables: &[
            ANIME_TABLE,
            RELEASES_TABLE,
            RELEASE_NAMES_TABLE,
            USER_PROGRESS_TABLE,
            COMPANY_RELEASE_MAP_TABLE,
            ANIME_RECOMMENDATIONS_TABLE,
            RELATED_ANIME_TABLE,
            CHANGE_LOG_TABLE,
        ],
        migration: Some(migrate_v0_to_v1),
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_schema_creates_and_validates() {
        let conn = Connection::open_in_memory().unwrap();
        let latest = CATALOG_VERSIONED_SCHEMAS.last().unwrap();
        latest.create(&conn).unwrap();
        latest.validate(&conn).unwrap();
    }

    #[test]
    fn test_v0_to_v1_migration_matches_v1_tables() {
        let conn = Connection::open_in_memory().unwrap();
        CATALOG_VERSIONED_SCHEMAS[0].create(&conn).unwrap();
        migrate_v0_to_v1(&conn).unwrap();
        CATALOG_VERSIONED_SCHEMAS[1].validate(&conn).unwrap();
    }
}
