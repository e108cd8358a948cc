//! Anikura Catalog Library
//!
//! Consistency layer for an anime catalog: business operations accumulate
//! entity mutations in a [`ChangeSet`], and the [`SaveEngine`] validates
//! cross-row invariants against pending plus committed state before the
//! batch commits, then cleans up dependent join rows after it commits.
//! Storage is a SQLite-backed catalog store.

pub mod catalog_store;
pub mod changeset;
pub mod save;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use catalog_store::{CatalogBackend, SqliteCatalogStore};
pub use changeset::{ChangeKind, ChangeSet, ChangeSetEntry, EntityKind, EntityRecord};
pub use save::{SaveEngine, SaveError, SaveReport, Violation};
