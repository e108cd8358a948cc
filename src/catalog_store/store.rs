//! SQLite-backed catalog store.
//!
//! Committed reads go through a small round-robin pool of read-only
//! connections; all writes share one mutex-guarded connection so SQLite sees
//! a single writer. Changesets are applied inside one `BEGIN IMMEDIATE`
//! transaction together with their repair actions and change-history rows.

use super::models::*;
use super::schema::CATALOG_VERSIONED_SCHEMAS;
use super::trait_def::{ApplyStats, CatalogBackend};
use crate::changeset::{ChangeKind, ChangeSet, ChangeSetEntry, EntityKind, EntityRecord};
use crate::save::RepairAction;
use anyhow::{bail, Context, Result};
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

/// Every entity kind the save engine may reference has a table here.
const MAPPED_KINDS: &[EntityKind] = &[
    EntityKind::Anime,
    EntityKind::Release,
    EntityKind::ReleaseName,
    EntityKind::CompanyReleaseMap,
    EntityKind::AnimeRecommendation,
    EntityKind::RelatedAnime,
    EntityKind::UserProgress,
];

/// SQLite-backed store for the anime catalog.
#[derive(Clone)]
pub struct SqliteCatalogStore {
    read_pool: Vec<Arc<Mutex<Connection>>>,
    write_conn: Arc<Mutex<Connection>>,
    read_index: Arc<AtomicUsize>,
}

fn migrate_if_needed(conn: &mut Connection) -> Result<()> {
    let latest = CATALOG_VERSIONED_SCHEMAS
        .last()
        .expect("at least one schema version");

    let table_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
            [],
            |r| r.get(0),
        )
        .unwrap_or(0);

    if table_count == 0 {
        // Brand new database - create the latest schema directly
        info!("Creating catalog db schema at version {}", latest.version);
        latest.create(conn)?;
        return Ok(());
    }

    let mut current_version: usize =
        conn.query_row("PRAGMA user_version", [], |r| r.get::<_, i64>(0))? as usize;
    if current_version >= latest.version {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for schema in CATALOG_VERSIONED_SCHEMAS.iter().skip(current_version + 1) {
        if let Some(migration_fn) = schema.migration {
            info!(
                "Migrating catalog db from version {} to {}",
                current_version, schema.version
            );
            migration_fn(&tx)?;
            current_version = schema.version;
        }
    }
    tx.pragma_update(None, "user_version", current_version)?;
    tx.commit()?;
    Ok(())
}

impl SqliteCatalogStore {
    /// Open (or create) a file-backed catalog store.
    ///
    /// # Arguments
    /// * `db_path` - Path to the SQLite database file
    /// * `read_pool_size` - Number of connections for concurrent read operations
    pub fn new<P: AsRef<Path>>(db_path: P, read_pool_size: usize) -> Result<Self> {
        let uri = db_path
            .as_ref()
            .to_str()
            .context("Catalog db path is not valid UTF-8")?
            .to_string();
        Self::open(&uri, read_pool_size, true)
    }

    /// Open a private in-memory store. Used by tests; the shared-cache URI
    /// lets the read pool see the write connection's database.
    pub fn new_in_memory() -> Result<Self> {
        let uri = format!("file:anikura-{}?mode=memory&cache=shared", Uuid::new_v4());
        Self::open(&uri, 2, false)
    }

    fn open(uri: &str, read_pool_size: usize, file_backed: bool) -> Result<Self> {
        let mut write_conn = Connection::open_with_flags(
            uri,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open catalog database")?;

        migrate_if_needed(&mut write_conn)?;
        CATALOG_VERSIONED_SCHEMAS
            .last()
            .expect("at least one schema version")
            .validate(&write_conn)
            .context("Catalog schema validation failed")?;

        write_conn.pragma_update(None, "foreign_keys", "ON")?;
        if file_backed {
            write_conn.pragma_update(None, "journal_mode", "WAL")?;
        }

        let anime_count: i64 = write_conn
            .query_row("SELECT COUNT(*) FROM anime", [], |r| r.get(0))
            .unwrap_or(0);
        let release_count: i64 = write_conn
            .query_row("SELECT COUNT(*) FROM releases", [], |r| r.get(0))
            .unwrap_or(0);
        info!(
            "Opened anime catalog: {} anime, {} releases",
            anime_count, release_count
        );

        let read_flags = if file_backed {
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            // A read-only handle would not keep the shared in-memory db alive
            // on its own; open the pool with the write flags instead.
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        };
        let mut read_pool = Vec::with_capacity(read_pool_size);
        for _ in 0..read_pool_size.max(1) {
            let read_conn = Connection::open_with_flags(uri, read_flags)?;
            read_pool.push(Arc::new(Mutex::new(read_conn)));
        }

        Ok(SqliteCatalogStore {
            write_conn: Arc::new(Mutex::new(write_conn)),
            read_pool,
            read_index: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn get_read_conn(&self) -> Arc<Mutex<Connection>> {
        let index = self.read_index.fetch_add(1, Ordering::SeqCst) % self.read_pool.len();
        self.read_pool[index].clone()
    }

    // =========================================================================
    // Row Parsing
    // =========================================================================

    fn parse_anime_row(row: &rusqlite::Row) -> rusqlite::Result<Anime> {
        let kind: String = row.get(2)?;
        Ok(Anime {
            id: row.get(0)?,
            title: row.get(1)?,
            kind: AnimeKind::from_db_str(&kind),
            synopsis: row.get(3)?,
            start_year: row.get(4)?,
        })
    }

    fn parse_release_row(row: &rusqlite::Row) -> rusqlite::Result<Release> {
        Ok(Release {
            id: row.get(0)?,
            anime_id: row.get(1)?,
            is_primary: row.get::<_, i32>(2)? != 0,
            language: row.get(3)?,
            episode_count: row.get(4)?,
            notes: row.get(5)?,
        })
    }

    fn parse_name_row(row: &rusqlite::Row) -> rusqlite::Result<ReleaseName> {
        Ok(ReleaseName {
            id: row.get(0)?,
            release_id: row.get(1)?,
            name: row.get(2)?,
            is_primary: row.get::<_, i32>(3)? != 0,
            script: row.get(4)?,
        })
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Get an anime by ID.
    pub fn get_anime(&self, id: &str) -> Result<Option<Anime>> {
        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT id, title, kind, synopsis, start_year FROM anime WHERE id = ?1",
        )?;
        match stmt.query_row(params![id], Self::parse_anime_row) {
            Ok(anime) => Ok(Some(anime)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Get a release by ID.
    pub fn get_release(&self, id: &str) -> Result<Option<Release>> {
        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT id, anime_id, is_primary, language, episode_count, notes
             FROM releases WHERE id = ?1",
        )?;
        match stmt.query_row(params![id], Self::parse_release_row) {
            Ok(release) => Ok(Some(release)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Get a release name by ID.
    pub fn get_release_name(&self, id: &str) -> Result<Option<ReleaseName>> {
        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT id, release_id, name, is_primary, script FROM release_names WHERE id = ?1",
        )?;
        match stmt.query_row(params![id], Self::parse_name_row) {
            Ok(name) => Ok(Some(name)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn releases_for_anime_inner(&self, anime_id: &str) -> Result<Vec<Release>> {
        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT id, anime_id, is_primary, language, episode_count, notes
             FROM releases WHERE anime_id = ?1 ORDER BY id",
        )?;
        let releases = stmt
            .query_map(params![anime_id], Self::parse_release_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(releases)
    }

    fn names_for_release_inner(&self, release_id: &str) -> Result<Vec<ReleaseName>> {
        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT id, release_id, name, is_primary, script
             FROM release_names WHERE release_id = ?1 ORDER BY id",
        )?;
        let names = stmt
            .query_map(params![release_id], Self::parse_name_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    /// Get all progress records for an anime.
    pub fn progress_for_anime(&self, anime_id: &str) -> Result<Vec<UserProgress>> {
        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT user_id, anime_id, episodes_seen
             FROM user_progress WHERE anime_id = ?1 ORDER BY user_id",
        )?;
        let rows = stmt
            .query_map(params![anime_id], |row| {
                Ok(UserProgress {
                    user_id: row.get(0)?,
                    anime_id: row.get(1)?,
                    episodes_seen: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Get all company maps referencing a release.
    pub fn company_maps_for_release(&self, release_id: &str) -> Result<Vec<CompanyReleaseMap>> {
        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT company_id, release_id, role
             FROM company_release_map WHERE release_id = ?1 ORDER BY company_id",
        )?;
        let rows = stmt
            .query_map(params![release_id], |row| {
                let role: String = row.get(2)?;
                Ok(CompanyReleaseMap {
                    company_id: row.get(0)?,
                    release_id: row.get(1)?,
                    role: CompanyRole::from_db_str(&role),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Get all recommendation rows referencing an anime, in either direction.
    pub fn recommendations_touching(&self, anime_id: &str) -> Result<Vec<AnimeRecommendation>> {
        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT anime_id, recommended_id FROM anime_recommendations
             WHERE anime_id = ?1 OR recommended_id = ?1 ORDER BY anime_id, recommended_id",
        )?;
        let rows = stmt
            .query_map(params![anime_id], |row| {
                Ok(AnimeRecommendation {
                    anime_id: row.get(0)?,
                    recommended_id: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Get all related-anime rows referencing an anime, in either direction.
    pub fn related_links_touching(&self, anime_id: &str) -> Result<Vec<RelatedAnime>> {
        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT anime_id, related_id, relation FROM related_anime
             WHERE anime_id = ?1 OR related_id = ?1 ORDER BY anime_id, related_id",
        )?;
        let rows = stmt
            .query_map(params![anime_id], |row| {
                let relation: String = row.get(2)?;
                Ok(RelatedAnime {
                    anime_id: row.get(0)?,
                    related_id: row.get(1)?,
                    relation: RelationKind::from_db_str(&relation),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Get the recorded change history for an entity, newest first.
    pub fn change_history(&self, kind: EntityKind, entity_id: &str) -> Result<Vec<ChangeLogEntry>> {
        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT id, changeset_id, entity_type, entity_id, operation, entity_snapshot, created_at
             FROM change_log WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY id DESC",
        )?;
        let rows = stmt
            .query_map(params![kind.to_db_str(), entity_id], |row| {
                let entity_type: String = row.get(2)?;
                let operation: String = row.get(4)?;
                let snapshot: String = row.get(5)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    entity_type,
                    row.get::<_, String>(3)?,
                    operation,
                    snapshot,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(id, changeset_id, entity_type, entity_id, operation, snapshot, created_at)| {
                    Ok(ChangeLogEntry {
                        id,
                        changeset_id,
                        entity_type: EntityKind::from_db_str(&entity_type),
                        entity_id,
                        operation: ChangeKind::from_db_str(&operation),
                        entity_snapshot: serde_json::from_str(&snapshot)
                            .context("Corrupt entity snapshot in change_log")?,
                        created_at,
                    })
                },
            )
            .collect()
    }

    // =========================================================================
    // Write Internals
    // =========================================================================

    fn apply_entry(conn: &Connection, changeset_id: &str, entry: &ChangeSetEntry) -> Result<()> {
        match (&entry.entity, entry.kind) {
            (EntityRecord::Anime(a), ChangeKind::Added) => {
                conn.execute(
                    "INSERT INTO anime (id, title, kind, synopsis, start_year)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        &a.id,
                        &a.title,
                        a.kind.to_db_str(),
                        &a.synopsis,
                        a.start_year
                    ],
                )?;
            }
            (EntityRecord::Anime(a), ChangeKind::Modified) => {
                conn.execute(
                    "UPDATE anime SET title = ?1, kind = ?2, synopsis = ?3, start_year = ?4
                     WHERE id = ?5",
                    params![
                        &a.title,
                        a.kind.to_db_str(),
                        &a.synopsis,
                        a.start_year,
                        &a.id
                    ],
                )?;
            }
            (EntityRecord::Anime(a), ChangeKind::Deleted) => {
                conn.execute("DELETE FROM anime WHERE id = ?1", params![&a.id])?;
            }
            (EntityRecord::Release(r), ChangeKind::Added) => {
                conn.execute(
                    "INSERT INTO releases (id, anime_id, is_primary, language, episode_count, notes)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        &r.id,
                        &r.anime_id,
                        r.is_primary as i32,
                        &r.language,
                        r.episode_count,
                        &r.notes
                    ],
                )?;
            }
            (EntityRecord::Release(r), ChangeKind::Modified) => {
                conn.execute(
                    "UPDATE releases SET anime_id = ?1, is_primary = ?2, language = ?3,
                     episode_count = ?4, notes = ?5 WHERE id = ?6",
                    params![
                        &r.anime_id,
                        r.is_primary as i32,
                        &r.language,
                        r.episode_count,
                        &r.notes,
                        &r.id
                    ],
                )?;
            }
            (EntityRecord::Release(r), ChangeKind::Deleted) => {
                conn.execute("DELETE FROM releases WHERE id = ?1", params![&r.id])?;
            }
            (EntityRecord::ReleaseName(n), ChangeKind::Added) => {
                conn.execute(
                    "INSERT INTO release_names (id, release_id, name, is_primary, script)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        &n.id,
                        &n.release_id,
                        &n.name,
                        n.is_primary as i32,
                        &n.script
                    ],
                )?;
            }
            (EntityRecord::ReleaseName(n), ChangeKind::Modified) => {
                conn.execute(
                    "UPDATE release_names SET release_id = ?1, name = ?2, is_primary = ?3,
                     script = ?4 WHERE id = ?5",
                    params![
                        &n.release_id,
                        &n.name,
                        n.is_primary as i32,
                        &n.script,
                        &n.id
                    ],
                )?;
            }
            (EntityRecord::ReleaseName(n), ChangeKind::Deleted) => {
                conn.execute("DELETE FROM release_names WHERE id = ?1", params![&n.id])?;
            }
            (EntityRecord::CompanyReleaseMap(m), ChangeKind::Added) => {
                conn.execute(
                    "INSERT INTO company_release_map (company_id, release_id, role)
                     VALUES (?1, ?2, ?3)",
                    params![&m.company_id, &m.release_id, m.role.to_db_str()],
                )?;
            }
            (EntityRecord::CompanyReleaseMap(m), ChangeKind::Modified) => {
                conn.execute(
                    "UPDATE company_release_map SET role = ?1
                     WHERE company_id = ?2 AND release_id = ?3",
                    params![m.role.to_db_str(), &m.company_id, &m.release_id],
                )?;
            }
            (EntityRecord::CompanyReleaseMap(m), ChangeKind::Deleted) => {
                conn.execute(
                    "DELETE FROM company_release_map WHERE company_id = ?1 AND release_id = ?2",
                    params![&m.company_id, &m.release_id],
                )?;
            }
            (EntityRecord::AnimeRecommendation(m), ChangeKind::Added) => {
                conn.execute(
                    "INSERT INTO anime_recommendations (anime_id, recommended_id) VALUES (?1, ?2)",
                    params![&m.anime_id, &m.recommended_id],
                )?;
            }
            (EntityRecord::AnimeRecommendation(_), ChangeKind::Modified) => {
                bail!("Recommendation rows have no modifiable fields");
            }
            (EntityRecord::AnimeRecommendation(m), ChangeKind::Deleted) => {
                conn.execute(
                    "DELETE FROM anime_recommendations WHERE anime_id = ?1 AND recommended_id = ?2",
                    params![&m.anime_id, &m.recommended_id],
                )?;
            }
            (EntityRecord::RelatedAnime(m), ChangeKind::Added) => {
                conn.execute(
                    "INSERT INTO related_anime (anime_id, related_id, relation)
                     VALUES (?1, ?2, ?3)",
                    params![&m.anime_id, &m.related_id, m.relation.to_db_str()],
                )?;
            }
            (EntityRecord::RelatedAnime(m), ChangeKind::Modified) => {
                conn.execute(
                    "UPDATE related_anime SET relation = ?1 WHERE anime_id = ?2 AND related_id = ?3",
                    params![m.relation.to_db_str(), &m.anime_id, &m.related_id],
                )?;
            }
            (EntityRecord::RelatedAnime(m), ChangeKind::Deleted) => {
                conn.execute(
                    "DELETE FROM related_anime WHERE anime_id = ?1 AND related_id = ?2",
                    params![&m.anime_id, &m.related_id],
                )?;
            }
            (EntityRecord::UserProgress(p), ChangeKind::Added) => {
                conn.execute(
                    "INSERT INTO user_progress (user_id, anime_id, episodes_seen)
                     VALUES (?1, ?2, ?3)",
                    params![&p.user_id, &p.anime_id, p.episodes_seen],
                )?;
            }
            (EntityRecord::UserProgress(p), ChangeKind::Modified) => {
                conn.execute(
                    "UPDATE user_progress SET episodes_seen = ?1
                     WHERE user_id = ?2 AND anime_id = ?3",
                    params![p.episodes_seen, &p.user_id, &p.anime_id],
                )?;
            }
            (EntityRecord::UserProgress(p), ChangeKind::Deleted) => {
                conn.execute(
                    "DELETE FROM user_progress WHERE user_id = ?1 AND anime_id = ?2",
                    params![&p.user_id, &p.anime_id],
                )?;
            }
        }

        let snapshot = serde_json::to_string(&entry.entity)
            .context("Failed to serialize entity snapshot")?;
        conn.execute(
            "INSERT INTO change_log (changeset_id, entity_type, entity_id, operation, entity_snapshot)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                changeset_id,
                entry.entity.kind().to_db_str(),
                entry.entity.id(),
                entry.kind.to_db_str(),
                snapshot
            ],
        )?;
        Ok(())
    }

    fn apply_repair(conn: &Connection, repair: &RepairAction) -> Result<usize> {
        match repair {
            RepairAction::ClampEpisodeProgress {
                anime_id,
                episode_cap,
            } => {
                let rows = conn.execute(
                    "UPDATE user_progress SET episodes_seen = ?1
                     WHERE anime_id = ?2 AND episodes_seen > ?1",
                    params![episode_cap, anime_id],
                )?;
                Ok(rows)
            }
        }
    }
}

impl CatalogBackend for SqliteCatalogStore {
    fn entity_exists(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let read_conn = self.get_read_conn();
        let conn = read_conn.lock().unwrap();
        let exists: bool = match kind {
            EntityKind::Anime => conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM anime WHERE id = ?1)",
                params![id],
                |r| r.get(0),
            )?,
            EntityKind::Release => conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM releases WHERE id = ?1)",
                params![id],
                |r| r.get(0),
            )?,
            EntityKind::ReleaseName => conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM release_names WHERE id = ?1)",
                params![id],
                |r| r.get(0),
            )?,
            EntityKind::CompanyReleaseMap => {
                let (company_id, release_id) = split_composite_id(id)?;
                conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM company_release_map
                     WHERE company_id = ?1 AND release_id = ?2)",
                    params![company_id, release_id],
                    |r| r.get(0),
                )?
            }
            EntityKind::AnimeRecommendation => {
                let (anime_id, recommended_id) = split_composite_id(id)?;
                conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM anime_recommendations
                     WHERE anime_id = ?1 AND recommended_id = ?2)",
                    params![anime_id, recommended_id],
                    |r| r.get(0),
                )?
            }
            EntityKind::RelatedAnime => {
                let (anime_id, related_id) = split_composite_id(id)?;
                conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM related_anime
                     WHERE anime_id = ?1 AND related_id = ?2)",
                    params![anime_id, related_id],
                    |r| r.get(0),
                )?
            }
            EntityKind::UserProgress => {
                let (user_id, anime_id) = split_composite_id(id)?;
                conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM user_progress
                     WHERE user_id = ?1 AND anime_id = ?2)",
                    params![user_id, anime_id],
                    |r| r.get(0),
                )?
            }
        };
        Ok(exists)
    }

    fn releases_for_anime(&self, anime_id: &str) -> Result<Vec<Release>> {
        self.releases_for_anime_inner(anime_id)
    }

    fn names_for_release(&self, release_id: &str) -> Result<Vec<ReleaseName>> {
        self.names_for_release_inner(release_id)
    }

    fn mapped_kinds(&self) -> &[EntityKind] {
        MAPPED_KINDS
    }

    fn apply_changeset(
        &self,
        changeset: &ChangeSet,
        repairs: &[RepairAction],
    ) -> Result<ApplyStats> {
        let conn = self.write_conn.lock().unwrap();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> Result<ApplyStats> {
            let mut stats = ApplyStats::default();
            for entry in changeset.entries() {
                Self::apply_entry(&conn, changeset.id(), entry).with_context(|| {
                    format!(
                        "Failed to apply {} of {} '{}'",
                        entry.kind.to_db_str(),
                        entry.entity.kind(),
                        entry.entity.id()
                    )
                })?;
                stats.entries_applied += 1;
            }
            for repair in repairs {
                stats.repair_rows += Self::apply_repair(&conn, repair)?;
            }
            Ok(stats)
        })();

        match result {
            Ok(stats) => {
                conn.execute("COMMIT", [])?;
                Ok(stats)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    fn delete_company_maps_for_releases(&self, release_ids: &[String]) -> Result<usize> {
        if release_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; release_ids.len()].join(", ");
        let conn = self.write_conn.lock().unwrap();
        let rows = conn.execute(
            &format!(
                "DELETE FROM company_release_map WHERE release_id IN ({})",
                placeholders
            ),
            params_from_iter(release_ids.iter()),
        )?;
        Ok(rows)
    }

    fn delete_recommendations_for_anime(&self, anime_ids: &[String]) -> Result<usize> {
        if anime_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; anime_ids.len()].join(", ");
        let conn = self.write_conn.lock().unwrap();
        let rows = conn.execute(
            &format!(
                "DELETE FROM anime_recommendations
                 WHERE anime_id IN ({0}) OR recommended_id IN ({0})",
                placeholders
            ),
            params_from_iter(anime_ids.iter().chain(anime_ids.iter())),
        )?;
        Ok(rows)
    }

    fn delete_related_links_for_anime(&self, anime_ids: &[String]) -> Result<usize> {
        if anime_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; anime_ids.len()].join(", ");
        let conn = self.write_conn.lock().unwrap();
        let rows = conn.execute(
            &format!(
                "DELETE FROM related_anime WHERE anime_id IN ({0}) OR related_id IN ({0})",
                placeholders
            ),
            params_from_iter(anime_ids.iter().chain(anime_ids.iter())),
        )?;
        Ok(rows)
    }

    fn delete_orphaned_company_maps(&self) -> Result<usize> {
        let conn = self.write_conn.lock().unwrap();
        let rows = conn.execute(
            "DELETE FROM company_release_map
             WHERE release_id NOT IN (SELECT id FROM releases)",
            [],
        )?;
        Ok(rows)
    }
}

fn split_composite_id(id: &str) -> Result<(&str, &str)> {
    id.split_once('/')
        .with_context(|| format!("Malformed composite entity id '{}'", id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_anime(id: &str) -> Anime {
        Anime {
            id: id.to_string(),
            title: format!("Anime {}", id),
            kind: AnimeKind::Tv,
            synopsis: None,
            start_year: Some(2020),
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

    #[test]
    fn test_apply_changeset_inserts_and_reads_back() {
        let store = SqliteCatalogStore::new_in_memory().unwrap();
        let mut cs = ChangeSet::new();
        cs.add(EntityRecord::Anime(make_anime("a1")));
        cs.add(EntityRecord::Release(make_release("r1", "a1", true)));

        let stats = store.apply_changeset(&cs, &[]).unwrap();
        assert_eq!(stats.entries_applied, 2);

        let anime = store.get_anime("a1").unwrap().unwrap();
        assert_eq!(anime.title, "Anime a1");
        let releases = store.releases_for_anime("a1").unwrap();
        assert_eq!(releases.len(), 1);
        assert!(releases[0].is_primary);
    }

    #[test]
    fn test_apply_changeset_rolls_back_on_failure() {
        let store = SqliteCatalogStore::new_in_memory().unwrap();
        let mut cs = ChangeSet::new();
        cs.add(EntityRecord::Anime(make_anime("a1")));
        // Duplicate primary key makes the second insert fail.
        cs.add(EntityRecord::Anime(make_anime("a1")));

        assert!(store.apply_changeset(&cs, &[]).is_err());
        assert!(store.get_anime("a1").unwrap().is_none());
    }

    #[test]
    fn test_anime_delete_cascades_to_children() {
        let store = SqliteCatalogStore::new_in_memory().unwrap();
        let mut cs = ChangeSet::new();
        cs.add(EntityRecord::Anime(make_anime("a1")));
        cs.add(EntityRecord::Release(make_release("r1", "a1", true)));
        cs.add(EntityRecord::UserProgress(UserProgress {
            user_id: "u1".to_string(),
            anime_id: "a1".to_string(),
            episodes_seen: 4,
        }));
        store.apply_changeset(&cs, &[]).unwrap();

        let mut delete = ChangeSet::new();
        delete.delete(EntityRecord::Anime(make_anime("a1")));
        store.apply_changeset(&delete, &[]).unwrap();

        assert!(store.get_release("r1").unwrap().is_none());
        assert!(store.progress_for_anime("a1").unwrap().is_empty());
    }

    #[test]
    fn test_clamp_repair_only_touches_rows_above_cap() {
        let store = SqliteCatalogStore::new_in_memory().unwrap();
        let mut cs = ChangeSet::new();
        cs.add(EntityRecord::Anime(make_anime("a1")));
        cs.add(EntityRecord::Release(make_release("r1", "a1", true)));
        for (user, seen) in [("u1", 10), ("u2", 24), ("u3", 30)] {
            cs.add(EntityRecord::UserProgress(UserProgress {
                user_id: user.to_string(),
                anime_id: "a1".to_string(),
                episodes_seen: seen,
            }));
        }
        store.apply_changeset(&cs, &[]).unwrap();

        let repair = RepairAction::ClampEpisodeProgress {
            anime_id: "a1".to_string(),
            episode_cap: 20,
        };
        let stats = store.apply_changeset(&ChangeSet::new(), &[repair]).unwrap();
        assert_eq!(stats.repair_rows, 2);

        let seen: Vec<i32> = store
            .progress_for_anime("a1")
            .unwrap()
            .into_iter()
            .map(|p| p.episodes_seen)
            .collect();
        assert_eq!(seen, vec![10, 20, 20]);
    }

    #[test]
    fn test_change_history_records_operations() {
        let store = SqliteCatalogStore::new_in_memory().unwrap();
        let mut cs = ChangeSet::new();
        cs.add(EntityRecord::Anime(make_anime("a1")));
        store.apply_changeset(&cs, &[]).unwrap();

        let updated = Anime {
            title: "Renamed".to_string(),
            ..make_anime("a1")
        };
        let mut cs2 = ChangeSet::new();
        cs2.update(
            EntityRecord::Anime(updated),
            EntityRecord::Anime(make_anime("a1")),
        );
        store.apply_changeset(&cs2, &[]).unwrap();

        let history = store.change_history(EntityKind::Anime, "a1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].operation, ChangeKind::Modified);
        assert_eq!(history[1].operation, ChangeKind::Added);
        assert_eq!(history[0].entity_snapshot["title"], "Renamed");
    }

    #[test]
    fn test_migration_from_v0_database() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("catalog.db");
        {
            let conn = Connection::open(&db_path).unwrap();
            CATALOG_VERSIONED_SCHEMAS[0].create(&conn).unwrap();
        }

        let store = SqliteCatalogStore::new(&db_path, 1).unwrap();
        let mut cs = ChangeSet::new();
        cs.add(EntityRecord::Anime(make_anime("a1")));
        cs.add(EntityRecord::Release(Release {
            notes: Some("remaster".to_string()),
            ..make_release("r1", "a1", true)
        }));
        store.apply_changeset(&cs, &[]).unwrap();

        let release = store.get_release("r1").unwrap().unwrap();
        assert_eq!(release.notes.as_deref(), Some("remaster"));
    }
}
