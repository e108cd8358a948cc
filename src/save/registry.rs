//! Process-wide hook registry.
//!
//! An explicit, statically built mapping from entity type to its ordered
//! hooks. Built once when the engine is constructed and never mutated
//! afterwards, so concurrent saves can read it without synchronization.
//! Slot order is dispatch order for both phases.

use super::hooks::{PostCommitHook, PreCommitHook};
use crate::changeset::EntityKind;
use thiserror::Error;

/// A hook references an entity type the backend has no storage mapping for.
/// Fatal at startup; cannot occur at request time.
#[derive(Debug, Error)]
#[error("no storage mapping for entity type '{kind}'")]
pub struct ConfigurationError {
    pub kind: EntityKind,
}

#[derive(Debug)]
struct HookSlot {
    kind: EntityKind,
    pre_commit: &'static [PreCommitHook],
    post_commit: &'static [PostCommitHook],
}

#[derive(Debug)]
pub struct HookRegistry {
    slots: Vec<HookSlot>,
}

impl HookRegistry {
    /// The standard hook wiring for the catalog.
    pub fn standard() -> Self {
        Self {
            slots: vec![
                HookSlot {
                    kind: EntityKind::Anime,
                    pre_commit: &[PreCommitHook::AnimeReleasePresence],
                    post_commit: &[PostCommitHook::AnimeRelationCleanup],
                },
                HookSlot {
                    kind: EntityKind::Release,
                    pre_commit: &[
                        PreCommitHook::ReleaseIntegrity,
                        PreCommitHook::EpisodeProgressClamp,
                    ],
                    post_commit: &[PostCommitHook::ReleaseCompanyMapCleanup],
                },
                HookSlot {
                    kind: EntityKind::ReleaseName,
                    pre_commit: &[PreCommitHook::ReleaseNameIntegrity],
                    post_commit: &[],
                },
            ],
        }
    }

    /// Fail fast when a hooked entity type has no storage mapping.
    pub fn verify_mappings(&self, mapped: &[EntityKind]) -> Result<(), ConfigurationError> {
        for slot in &self.slots {
            if !mapped.contains(&slot.kind) {
                return Err(ConfigurationError { kind: slot.kind });
            }
        }
        Ok(())
    }

    /// Hooked entity kinds in registration order.
    pub fn kinds(&self) -> impl Iterator<Item = EntityKind> + '_ {
        self.slots.iter().map(|s| s.kind)
    }

    pub fn pre_commit_hooks(&self, kind: EntityKind) -> &[PreCommitHook] {
        self.slots
            .iter()
            .find(|s| s.kind == kind)
            .map(|s| s.pre_commit)
            .unwrap_or(&[])
    }

    pub fn post_commit_hooks(&self, kind: EntityKind) -> &[PostCommitHook] {
        self.slots
            .iter()
            .find(|s| s.kind == kind)
            .map(|s| s.post_commit)
            .unwrap_or(&[])
    }
}
