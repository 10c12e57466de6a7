//! Per-entity catalog of generations.
//!
//! The catalog is the only authoritative record of which generations exist,
//! which succeeded, and what each incremental generation depends on. It is
//! persisted to the repository target as a JSON document.

use crate::backup::generation::{BackupMode, EntityInfo, Generation, GenerationId};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::target::RepositoryTarget;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CATALOG_FORMAT_VERSION: u32 = 1;

/// Lifecycle of the in-memory catalog relative to its persisted document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CatalogState {
    /// Created in memory, nothing read or written yet
    #[default]
    Unloaded,
    /// Read from the target and unchanged since
    Loaded,
    /// Modified since the last load or persist
    Dirty,
    /// Written to the target and unchanged since
    Persisted,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GenerationsCatalog {
    format_version: u32,
    entity: EntityInfo,
    next_generation_id: GenerationId,
    generations: BTreeMap<GenerationId, Generation>,
    #[serde(skip)]
    state: CatalogState,
}

impl GenerationsCatalog {
    pub fn new(entity: EntityInfo) -> Self {
        Self {
            format_version: CATALOG_FORMAT_VERSION,
            entity,
            next_generation_id: 0,
            generations: BTreeMap::new(),
            state: CatalogState::Unloaded,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut catalog: GenerationsCatalog = serde_json::from_slice(bytes)?;
        if catalog.format_version > CATALOG_FORMAT_VERSION {
            return Err(Error::InconsistentCatalog(format!(
                "unsupported format version {}",
                catalog.format_version
            )));
        }
        catalog.check_consistency()?;
        if let Some(last) = catalog.generations.keys().next_back() {
            catalog.next_generation_id = catalog.next_generation_id.max(last + 1);
        }
        catalog.state = CatalogState::Loaded;
        Ok(catalog)
    }

    /// Every record sits under its own id, and every succeeded incremental
    /// has an older succeeded parent.
    fn check_consistency(&self) -> Result<()> {
        for (key, generation) in &self.generations {
            let id = generation.id();
            if *key != id {
                return Err(Error::InconsistentCatalog(format!(
                    "generation {id} is stored under key {key}"
                )));
            }
            if !generation.is_succeeded() || generation.backup_mode() != BackupMode::Incremental {
                continue;
            }
            match generation.previous_generation_id() {
                Some(parent) if parent < id && self.is_generation_succeeded(parent) => {}
                Some(parent) => return Err(Error::BrokenChain { id, missing: parent }),
                None => return Err(Error::BrokenChain { id, missing: id }),
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn state(&self) -> CatalogState {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self.state, CatalogState::Dirty | CatalogState::Unloaded)
    }

    pub fn mark_dirty(&mut self) {
        self.state = CatalogState::Dirty;
    }

    /// Posts the document to `target`. The catalog stays dirty when the
    /// target refuses it.
    pub fn persist(&mut self, target: &dyn RepositoryTarget) -> Result<bool> {
        let bytes = self.to_bytes()?;
        let posted = target.post_generations_catalog(self.entity.uuid(), &bytes)?;
        if posted {
            self.state = CatalogState::Persisted;
            tracing::debug!(
                "Persisted catalog of {} ({} generations)",
                self.entity.uuid(),
                self.generations.len()
            );
        } else {
            self.mark_dirty();
            tracing::warn!("Target refused catalog of {}", self.entity.uuid());
        }
        Ok(posted)
    }

    pub fn entity(&self) -> &EntityInfo {
        &self.entity
    }

    /// Aligns name and server id with the live entity. The unique id must
    /// match; it is never rewritten.
    pub fn reconcile_entity(&mut self, live: &EntityInfo) -> Result<bool> {
        if !self.entity.uuid().eq_ignore_ascii_case(live.uuid()) {
            return Err(Error::IdentityMismatch {
                catalog_uuid: self.entity.uuid().clone(),
                entity_uuid: live.uuid().clone(),
            });
        }
        let mut changed = false;
        if self.entity.name() != live.name() {
            tracing::info!(
                "Entity {} renamed {:?} -> {:?}",
                live.uuid(),
                self.entity.name(),
                live.name()
            );
            self.entity.set_name(live.name().clone());
            changed = true;
        }
        if self.entity.server_uuid() != live.server_uuid() {
            tracing::info!(
                "Entity {} moved to server {}",
                live.uuid(),
                live.server_uuid()
            );
            self.entity.set_server_uuid(live.server_uuid().clone());
            changed = true;
        }
        if changed {
            self.mark_dirty();
        }
        Ok(changed)
    }

    /// Allocates the next id and records a pending generation for it.
    pub fn create_new_generation_id(
        &mut self,
        timestamp: DateTime<Utc>,
        forced_mode: BackupMode,
    ) -> GenerationId {
        let id = self.next_generation_id;
        self.next_generation_id += 1;
        let previous = if forced_mode == BackupMode::Full {
            None
        } else {
            self.latest_succeeded_generation_id()
        };
        self.generations
            .insert(id, Generation::pending(id, timestamp, forced_mode, previous));
        self.mark_dirty();
        tracing::debug!(
            "Allocated generation {} of {} (mode {}, parent {:?})",
            id,
            self.entity.uuid(),
            forced_mode,
            previous
        );
        id
    }

    /// Seals `generation` into the catalog with its final `mode`.
    ///
    /// A generation is sealed once. A succeeded incremental generation must
    /// depend on an older succeeded generation.
    pub fn set_generation_info(&mut self, generation: &Generation, mode: BackupMode) -> Result<()> {
        let id = generation.id();
        let record = self
            .generations
            .get(&id)
            .ok_or(Error::GenerationNotFound(id))?;
        if record.is_sealed() {
            return Err(Error::GenerationAlreadySealed(id));
        }
        let succeeded = generation.succeeded().unwrap_or(false);
        if succeeded && mode == BackupMode::Incremental {
            match generation.previous_generation_id() {
                Some(parent) if parent < id && self.is_generation_succeeded(parent) => {}
                Some(parent) => return Err(Error::BrokenChain { id, missing: parent }),
                None => return Err(Error::BrokenChain { id, missing: id }),
            }
        }

        let mut sealed = generation.clone();
        sealed.set_backup_mode(mode);
        sealed.set_succeeded(succeeded);
        self.generations.insert(id, sealed);
        self.mark_dirty();
        tracing::info!(
            "Generation {} of {} sealed: mode {}, succeeded {}",
            id,
            self.entity.uuid(),
            mode,
            succeeded
        );
        Ok(())
    }

    /// Replaces a pending record, e.g. once its disks are known.
    pub(crate) fn update_pending_generation(&mut self, generation: Generation) -> Result<()> {
        let id = generation.id();
        match self.generations.get(&id) {
            None => Err(Error::GenerationNotFound(id)),
            Some(record) if record.is_sealed() => Err(Error::GenerationAlreadySealed(id)),
            Some(_) => {
                self.generations.insert(id, generation);
                self.mark_dirty();
                Ok(())
            }
        }
    }

    pub fn generation(&self, id: GenerationId) -> Option<&Generation> {
        self.generations.get(&id)
    }

    pub fn generations(&self) -> &BTreeMap<GenerationId, Generation> {
        &self.generations
    }

    pub fn latest_generation_id(&self) -> Option<GenerationId> {
        self.generations.keys().next_back().copied()
    }

    pub fn latest_generation(&self) -> Option<&Generation> {
        self.generations.values().next_back()
    }

    pub fn latest_succeeded_generation_id(&self) -> Option<GenerationId> {
        self.latest_succeeded_generation().map(Generation::id)
    }

    pub fn latest_succeeded_generation(&self) -> Option<&Generation> {
        self.generations.values().rev().find(|g| g.is_succeeded())
    }

    /// Highest succeeded id not above `bound`.
    pub fn latest_succeeded_generation_id_up_to(&self, bound: GenerationId) -> Option<GenerationId> {
        self.generations
            .range(..=bound)
            .rev()
            .find(|(_, g)| g.is_succeeded())
            .map(|(id, _)| *id)
    }

    pub fn prev_succeeded_generation_id(&self, id: GenerationId) -> Option<GenerationId> {
        self.generations
            .range(..id)
            .rev()
            .find(|(_, g)| g.is_succeeded())
            .map(|(id, _)| *id)
    }

    pub fn next_succeeded_generation_id(&self, id: GenerationId) -> Option<GenerationId> {
        self.generations
            .range(id.saturating_add(1)..)
            .find(|(other, g)| **other > id && g.is_succeeded())
            .map(|(id, _)| *id)
    }

    /// What generation `id` depends on, as recorded.
    pub fn depending_generation_id(&self, id: GenerationId) -> Result<Option<GenerationId>> {
        self.generations
            .get(&id)
            .map(Generation::previous_generation_id)
            .ok_or(Error::GenerationNotFound(id))
    }

    /// Every generation recording `id` as its parent.
    pub fn depending_generation_list(&self, id: GenerationId) -> Vec<GenerationId> {
        self.generations
            .values()
            .filter(|g| g.previous_generation_id() == Some(id))
            .map(Generation::id)
            .collect_vec()
    }

    /// Generations that did not succeed, pending ones included.
    pub fn failed_generation_list(&self) -> Vec<GenerationId> {
        self.generations
            .values()
            .filter(|g| !g.is_succeeded())
            .map(Generation::id)
            .collect_vec()
    }

    pub fn succeeded_generation_list(&self) -> Vec<GenerationId> {
        self.generations
            .values()
            .filter(|g| g.is_succeeded())
            .map(Generation::id)
            .collect_vec()
    }

    pub fn generation_id_list(&self) -> Vec<GenerationId> {
        self.generations.keys().copied().collect_vec()
    }

    pub fn num_of_generations(&self) -> usize {
        self.generations.len()
    }

    pub fn num_of_succeeded_generations(&self) -> usize {
        self.generations.values().filter(|g| g.is_succeeded()).count()
    }

    pub fn timestamp(&self, id: GenerationId) -> Option<DateTime<Utc>> {
        self.generations.get(&id).map(Generation::timestamp)
    }

    pub fn is_generation_exist(&self, id: GenerationId) -> bool {
        self.generations.contains_key(&id)
    }

    pub fn is_generation_succeeded(&self, id: GenerationId) -> bool {
        self.generations.get(&id).is_some_and(Generation::is_succeeded)
    }

    /// Drops one record. Callers are responsible for dependents; see
    /// `ArchiveManager::remove_generation`.
    pub fn remove_generation(&mut self, id: GenerationId) -> Result<Generation> {
        let removed = self
            .generations
            .remove(&id)
            .ok_or(Error::GenerationNotFound(id))?;
        self.mark_dirty();
        Ok(removed)
    }

    /// Generations to apply, oldest first, to rebuild generation `id`.
    pub fn restore_chain(&self, id: GenerationId) -> Result<Vec<GenerationId>> {
        let mut chain = Vec::new();
        let mut current = id;
        loop {
            let generation = self
                .generations
                .get(&current)
                .filter(|g| g.is_succeeded())
                .ok_or(Error::BrokenChain {
                    id,
                    missing: current,
                })?;
            chain.push(current);
            match (generation.backup_mode(), generation.previous_generation_id()) {
                (BackupMode::Incremental, Some(parent)) if parent < current => current = parent,
                (BackupMode::Incremental, Some(parent)) => {
                    return Err(Error::BrokenChain { id, missing: parent })
                }
                (BackupMode::Incremental, None) => {
                    return Err(Error::BrokenChain {
                        id,
                        missing: current,
                    })
                }
                _ => break,
            }
        }
        chain.reverse();
        Ok(chain)
    }
}
